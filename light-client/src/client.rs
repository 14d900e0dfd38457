use std::time::Duration;

use boblight_model::{Color, Light};
use tokio::sync::watch;

use crate::{ClientConfig, ConnectionState, Connector, LightClientError, StreamOpener};

/// High level boblight client.
///
/// A thin layer over [`Connector`] that remembers where to connect and adds a
/// few conveniences, such as setting every light at once.
pub struct BoblightClient {
    config: ClientConfig,
    connector: Connector,
}

impl BoblightClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            connector: Connector::new(config.clone()),
            config,
        }
    }

    pub fn with_opener(config: ClientConfig, opener: impl StreamOpener + 'static) -> Self {
        Self {
            connector: Connector::with_opener(config.clone(), opener),
            config,
        }
    }

    pub async fn connect(&self) -> Result<(), LightClientError> {
        self.connector
            .connect(&self.config.host, self.config.port, self.config.priority)
            .await
    }

    pub async fn reconnect(&self) -> Result<(), LightClientError> {
        self.connector.reconnect().await
    }

    pub async fn close(&self) {
        self.connector.close().await
    }

    pub fn lights(&self) -> Vec<Light> {
        self.connector.lights()
    }

    pub fn light(&self, name: &str) -> Option<Light> {
        self.lights().into_iter().find(|light| light.name() == name)
    }

    pub async fn refresh_lights(&self) -> Result<Vec<Light>, LightClientError> {
        self.connector.refresh_lights().await
    }

    /// Sets every known light to `color`, then syncs once.
    pub async fn set_color_for_all(&self, color: Color) -> Result<(), LightClientError> {
        for light in self.lights() {
            self.connector.set_color(&light, color).await?;
        }
        self.sync().await
    }

    /// Sets a single light and syncs right away.
    pub async fn set_color(&self, light: &Light, color: Color) -> Result<(), LightClientError> {
        self.connector.set_color(light, color).await?;
        self.sync().await
    }

    pub async fn set_speed(&self, light: &Light, speed: f64) -> Result<(), LightClientError> {
        self.connector.set_speed(light, speed).await
    }

    pub async fn set_interpolation(
        &self,
        light: &Light,
        interpolation: f64,
    ) -> Result<(), LightClientError> {
        self.connector.set_interpolation(light, interpolation).await
    }

    pub async fn set_priority(&self, priority: u16) -> Result<(), LightClientError> {
        self.connector.set_priority(priority).await
    }

    pub async fn sync(&self) -> Result<(), LightClientError> {
        self.connector.sync().await
    }

    pub async fn ping(&self) -> Result<(), LightClientError> {
        self.connector.ping().await
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }

    pub fn state(&self) -> ConnectionState {
        self.connector.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.connector.subscribe()
    }

    pub fn version(&self) -> Option<String> {
        self.connector.version()
    }

    pub fn priority(&self) -> u16 {
        self.connector.priority()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }
}
