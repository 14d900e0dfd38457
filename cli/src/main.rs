use std::{error::Error, fs, path::PathBuf};

use boblight_light_client::{BoblightClient, ClientConfig, Color, Light};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file with client configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Server address as tcp://host:port?priority=N
    #[arg(short, long, conflicts_with_all = ["host", "port"])]
    url: Option<Url>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    priority: Option<u16>,
    #[arg(short, long)]
    verbose: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// List the lights exposed by the server
    Lights,
    /// Set a color by name (red, orange, ...) or as an r,g,b triple
    Color {
        color: Color,
        #[arg(short, long)]
        light: Option<String>,
    },
    Speed {
        speed: f64,
        #[arg(short, long)]
        light: Option<String>,
    },
    Interpolation {
        interpolation: f64,
        #[arg(short, long)]
        light: Option<String>,
    },
    Ping,
}

fn init_logging(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &cli.log_file {
        loggers.push(WriteLogger::new(
            LevelFilter::Debug,
            ConfigBuilder::new().set_time_format_rfc3339().build(),
            fs::OpenOptions::new().append(true).create(true).open(path)?,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ClientConfig, Box<dyn Error>> {
    let mut config = match (&cli.url, &cli.config) {
        (Some(url), _) => ClientConfig::from_url(url)?,
        (None, Some(path)) => serde_json::from_str(&fs::read_to_string(path)?)?,
        (None, None) => ClientConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(priority) = cli.priority {
        config.priority = priority;
    }
    Ok(config)
}

fn select_lights(client: &BoblightClient, name: Option<&str>) -> Result<Vec<Light>, Box<dyn Error>> {
    match name {
        Some(name) => match client.light(name) {
            Some(light) => Ok(vec![light]),
            None => Err(format!("Unknown light: {name}"))?,
        },
        None => Ok(client.lights()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = load_config(&cli)?;
    info!("Connecting to {}:{}", config.host, config.port);
    let client = BoblightClient::new(config);
    client.connect().await?;

    match cli.command {
        Action::Lights => {
            println!("server version: {}", client.version().unwrap_or_default());
            for light in client.lights() {
                println!("{}", light.name());
            }
        }
        Action::Color { color, light } => match light {
            Some(name) => {
                for light in select_lights(&client, Some(&name))? {
                    client.set_color(&light, color).await?;
                }
            }
            None => client.set_color_for_all(color).await?,
        },
        Action::Speed { speed, light } => {
            for light in select_lights(&client, light.as_deref())? {
                client.set_speed(&light, speed).await?;
            }
        }
        Action::Interpolation {
            interpolation,
            light,
        } => {
            for light in select_lights(&client, light.as_deref())? {
                client.set_interpolation(&light, interpolation).await?;
            }
        }
        Action::Ping => {
            client.ping().await?;
            println!("pong");
        }
    }

    client.close().await;
    Ok(())
}
