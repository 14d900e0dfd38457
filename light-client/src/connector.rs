use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use boblight_model::{Color, Light};
use log::{error, info, warn};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
};

use crate::{
    dispatch::{self, PendingRequest},
    protocol::{Command, Response},
    transport::{LineTransport, StreamOpener, TcpOpener},
    ClientConfig, LightClientError,
};

type Result<T> = std::result::Result<T, LightClientError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHello,
    AwaitingVersion,
    EnumeratingLights,
    Ready,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug)]
struct Endpoint {
    host: String,
    port: u16,
}

/// The live connection. Only touched while holding the session lock, which
/// makes every operation wait for the one before it.
#[derive(Default)]
struct Session {
    endpoint: Option<Endpoint>,
    transport: Option<LineTransport>,
    requests: Option<mpsc::UnboundedSender<PendingRequest>>,
    dispatcher: Option<JoinHandle<Option<LightClientError>>>,
}

/// What the handshake learned about the server.
struct Discovery {
    lights: Vec<Light>,
    version: Option<String>,
    priority: u16,
}

/// Speaks the boblight protocol over a single connection.
///
/// Operations are serialized: while one is waiting for the server, others
/// queue up behind it in the order they were called. Only one request is
/// ever outstanding on the wire.
pub struct Connector {
    opener: Box<dyn StreamOpener>,
    config: ClientConfig,
    session: AsyncMutex<Session>,
    discovery: Mutex<Discovery>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Connector {
    pub fn new(config: ClientConfig) -> Self {
        let opener = TcpOpener::new(config.connect_timeout);
        Self::with_opener(config, opener)
    }

    pub fn with_opener(config: ClientConfig, opener: impl StreamOpener + 'static) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            opener: Box::new(opener),
            discovery: Mutex::new(Discovery {
                lights: Vec::new(),
                version: None,
                priority: config.priority,
            }),
            config,
            session: AsyncMutex::new(Session::default()),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Every state change of the connection, starting with the current state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// A copy of the lights discovered during the handshake, in server order.
    pub fn lights(&self) -> Vec<Light> {
        self.discovery().lights.clone()
    }

    pub fn version(&self) -> Option<String> {
        self.discovery().version.clone()
    }

    pub fn priority(&self) -> u16 {
        self.discovery().priority
    }

    /// Connects and runs the handshake. Returns once the connection is ready
    /// for commands. An existing connection is closed first.
    pub async fn connect(&self, host: &str, port: u16, priority: u16) -> Result<()> {
        Command::SetPriority(priority).validate()?;
        let mut session = self.session.lock().await;
        self.teardown(&mut session).await;

        session.endpoint = Some(Endpoint {
            host: host.to_owned(),
            port,
        });
        self.discovery().priority = priority;
        self.establish(&mut session).await
    }

    /// Drops the current connection, if any, and runs the handshake again
    /// against the same server with the current priority.
    pub async fn reconnect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.endpoint.is_none() {
            return Err(LightClientError::NotConnected {
                state: self.state(),
            });
        }
        self.set_state(ConnectionState::Reconnecting);
        self.teardown(&mut session).await;
        self.establish(&mut session).await
    }

    /// Closes the connection. Requests still waiting for a response fail
    /// with [`LightClientError::ConnectionClosed`].
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        self.teardown(&mut session).await;
        self.set_state(ConnectionState::Closed);
    }

    /// Asks the server for its lights again and replaces the known set.
    pub async fn refresh_lights(&self) -> Result<Vec<Light>> {
        let mut session = self.session.lock().await;
        self.ensure_ready()?;
        let lights = self
            .request(&mut session, &Command::GetLights)
            .await?
            .into_lights()?;
        info!("Discovered {} lights", lights.len());
        self.discovery().lights = lights.clone();
        Ok(lights)
    }

    pub async fn set_color(&self, light: &Light, color: Color) -> Result<()> {
        self.send(Command::SetColor {
            light: light.name(),
            color,
        })
        .await?;

        let mut discovery = self.discovery();
        if let Some(known) = discovery
            .lights
            .iter_mut()
            .find(|known| known.name() == light.name())
        {
            known.set_color(color);
        }
        Ok(())
    }

    pub async fn set_speed(&self, light: &Light, speed: f64) -> Result<()> {
        self.send(Command::SetSpeed {
            light: light.name(),
            speed,
        })
        .await
    }

    pub async fn set_interpolation(&self, light: &Light, value: f64) -> Result<()> {
        self.send(Command::SetInterpolation {
            light: light.name(),
            value,
        })
        .await
    }

    pub async fn set_priority(&self, priority: u16) -> Result<()> {
        self.send(Command::SetPriority(priority)).await?;
        self.discovery().priority = priority;
        Ok(())
    }

    /// Makes the server apply all updates sent since the last sync.
    pub async fn sync(&self) -> Result<()> {
        self.send(Command::Sync).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(Command::Ping).await
    }

    /// Sends a command the server does not answer.
    async fn send(&self, command: Command<'_>) -> Result<()> {
        command.validate()?;
        let mut session = self.session.lock().await;
        self.ensure_ready()?;
        self.write(&mut session, &command).await
    }

    async fn establish(&self, session: &mut Session) -> Result<()> {
        let Some(endpoint) = session.endpoint.clone() else {
            return Err(LightClientError::NotConnected {
                state: self.state(),
            });
        };
        {
            let mut discovery = self.discovery();
            discovery.lights.clear();
            discovery.version = None;
        }

        self.set_state(ConnectionState::Connecting);
        let stream = match self.opener.open(&endpoint.host, endpoint.port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Failed to connect to boblight server at {}:{}: {e}",
                    endpoint.host, endpoint.port
                );
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (transport, events) = LineTransport::new(stream, self.config.idle_timeout);
        let (requests, pending) = mpsc::unbounded_channel();
        session.dispatcher = Some(tokio::spawn(dispatch::run(
            events,
            pending,
            self.state.clone(),
        )));
        session.transport = Some(transport);
        session.requests = Some(requests);

        if let Err(e) = self.handshake(session).await {
            let e = self.teardown(session).await.unwrap_or(e);
            error!("Handshake with boblight server failed: {e}");
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }
        Ok(())
    }

    async fn handshake(&self, session: &mut Session) -> Result<()> {
        info!("Connected to boblight server, saying hello");
        self.advance(ConnectionState::Connecting, ConnectionState::AwaitingHello)?;
        let hello = self
            .request(session, &Command::Hello)
            .await?
            .into_line()?;
        if hello != "hello" {
            return Err(LightClientError::Protocol {
                reason: format!("expected `hello`, got {hello:?}"),
            });
        }

        self.advance(
            ConnectionState::AwaitingHello,
            ConnectionState::AwaitingVersion,
        )?;
        let version = self
            .request(session, &Command::GetVersion)
            .await?
            .into_line()?;
        info!("Boblight server version: {version}");
        self.discovery().version = Some(version);

        self.advance(
            ConnectionState::AwaitingVersion,
            ConnectionState::EnumeratingLights,
        )?;
        let lights = self
            .request(session, &Command::GetLights)
            .await?
            .into_lights()?;
        info!("Discovered {} lights", lights.len());
        self.discovery().lights = lights;

        let priority = self.priority();
        self.write(session, &Command::SetPriority(priority)).await?;
        self.advance(ConnectionState::EnumeratingLights, ConnectionState::Ready)
    }

    /// Sends a command and waits for its response.
    async fn request(&self, session: &mut Session, command: &Command<'_>) -> Result<Response> {
        let Some(shape) = command.response_shape() else {
            return Err(LightClientError::Protocol {
                reason: format!("`{command}` has no response"),
            });
        };
        let line = command.to_string();
        let (pending, response) = PendingRequest::new(line.clone(), shape);

        let queued = session
            .requests
            .as_ref()
            .map(|requests| requests.send(pending).is_ok())
            .unwrap_or(false);
        if !queued {
            return Err(self.abort(session, LightClientError::ConnectionClosed).await);
        }
        self.write(session, command).await?;

        let result = match tokio::time::timeout(self.config.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LightClientError::ConnectionClosed),
            Err(_) => {
                warn!("No response to `{line}` within {:?}", self.config.request_timeout);
                Err(LightClientError::Timeout { command: line })
            }
        };
        match result {
            Ok(response) => Ok(response),
            Err(e) => Err(self.abort(session, e).await),
        }
    }

    async fn write(&self, session: &mut Session, command: &Command<'_>) -> Result<()> {
        let result = match session.transport.as_mut() {
            Some(transport) => transport.write_line(&command.to_string()).await,
            None => Err(LightClientError::ConnectionClosed),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(session, e).await),
        }
    }

    /// A failed exchange leaves the line in an unknown state, so the
    /// connection is dropped.
    async fn abort(&self, session: &mut Session, error: LightClientError) -> LightClientError {
        let fault = self.teardown(session).await;
        self.set_state(ConnectionState::Closed);
        fault.unwrap_or(error)
    }

    /// Closes the transport and waits for the dispatcher to fail whatever was
    /// still pending, so that no two connections are ever live at once.
    /// Returns the protocol violation that closed the connection, if any.
    async fn teardown(&self, session: &mut Session) -> Option<LightClientError> {
        session.requests = None;
        if let Some(transport) = session.transport.take() {
            transport.close().await;
        }
        match session.dispatcher.take()?.await {
            Ok(fault) => fault,
            Err(e) => {
                warn!("Dispatcher task failed: {e}");
                None
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(LightClientError::NotConnected { state }),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                info!("Connection state: {state} -> {next}");
                *state = next;
                true
            }
        });
    }

    /// Moves to `next` unless the connection was lost in the meantime.
    fn advance(&self, from: ConnectionState, next: ConnectionState) -> Result<()> {
        let mut advanced = false;
        self.state.send_if_modified(|state| {
            if *state == from {
                info!("Connection state: {state} -> {next}");
                *state = next;
                advanced = true;
            }
            advanced
        });
        if advanced {
            Ok(())
        } else {
            Err(LightClientError::ConnectionClosed)
        }
    }

    fn discovery(&self) -> MutexGuard<'_, Discovery> {
        self.discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.session.get_mut().dispatcher.take() {
            dispatcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_server::{FakeOpener, FakeServer, Script};

    fn config() -> ClientConfig {
        ClientConfig::default().with_request_timeout(Duration::from_millis(200))
    }

    async fn connected(lights: &[&str]) -> (Connector, FakeServer) {
        let (stream, mut server) = FakeServer::spawn(Script::handshake(lights));
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));
        connector.connect("localhost", 19333, 128).await.unwrap();
        server.skip_handshake().await;
        (connector, server)
    }

    #[tokio::test]
    async fn handshake_discovers_lights_in_order() {
        let (stream, mut server) = FakeServer::spawn(Script::handshake(&["A", "B"]));
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));

        connector.connect("localhost", 19333, 128).await.unwrap();

        assert_eq!(connector.state(), ConnectionState::Ready);
        assert_eq!(connector.lights(), vec![Light::new("A"), Light::new("B")]);
        assert_eq!(connector.version().as_deref(), Some("5"));
        assert_eq!(server.next_command().await.as_deref(), Some("hello"));
        assert_eq!(server.next_command().await.as_deref(), Some("get version"));
        assert_eq!(server.next_command().await.as_deref(), Some("get lights"));
        assert_eq!(
            server.next_command().await.as_deref(),
            Some("set priority 128")
        );
    }

    #[tokio::test]
    async fn server_without_lights_is_ready() {
        let (connector, _server) = connected(&[]).await;
        assert_eq!(connector.state(), ConnectionState::Ready);
        assert!(connector.lights().is_empty());
    }

    #[tokio::test]
    async fn refused_connection_returns_to_disconnected() {
        let connector = Connector::with_opener(config(), FakeOpener::refusing());

        let result = connector.connect("localhost", 19333, 128).await;

        assert!(matches!(
            result,
            Err(LightClientError::ConnectionFailed { .. })
        ));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wrong_greeting_closes_connection() {
        let script = Script::handshake(&["A"]).replace("hello", &["bonjour"]);
        let (stream, _server) = FakeServer::spawn(script);
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));

        let result = connector.connect("localhost", 19333, 128).await;

        assert!(matches!(result, Err(LightClientError::Protocol { .. })));
        assert_eq!(connector.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn short_enumeration_closes_connection() {
        let script =
            Script::handshake(&[]).replace("get lights", &["lights 2", "light A", "sync"]);
        let (stream, _server) = FakeServer::spawn(script);
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));

        let result = connector.connect("localhost", 19333, 128).await;

        assert!(matches!(result, Err(LightClientError::Protocol { .. })));
        assert_eq!(connector.state(), ConnectionState::Closed);
        assert!(connector.lights().is_empty());
    }

    #[tokio::test]
    async fn surplus_lights_close_connection() {
        let script =
            Script::handshake(&[]).replace("get lights", &["lights 1", "light A", "light B"]);
        let (stream, _server) = FakeServer::spawn(script);
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));

        let result = connector.connect("localhost", 19333, 128).await;

        assert!(matches!(result, Err(LightClientError::Protocol { .. })));
        assert_eq!(connector.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn light_without_count_closes_connection() {
        let script = Script::handshake(&[]).replace("get lights", &["light A"]);
        let (stream, _server) = FakeServer::spawn(script);
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));

        let result = connector.connect("localhost", 19333, 128).await;

        assert!(matches!(result, Err(LightClientError::Protocol { .. })));
        assert_eq!(connector.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let script = Script::handshake(&["A"]).silent("get version");
        let (stream, _server) = FakeServer::spawn(script);
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));

        let result = connector.connect("localhost", 19333, 128).await;

        match result {
            Err(LightClientError::Timeout { command }) => assert_eq!(command, "get version"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(connector.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn commands_require_ready_connection() {
        let connector = Connector::with_opener(config(), FakeOpener::refusing());
        let light = Light::new("A");

        let results = [
            connector.set_color(&light, Color::white()).await,
            connector.set_speed(&light, 0.5).await,
            connector.set_interpolation(&light, 0.5).await,
            connector.set_priority(100).await,
            connector.sync().await,
            connector.ping().await,
            connector.refresh_lights().await.map(|_| ()),
        ];

        for result in results {
            assert!(matches!(
                result,
                Err(LightClientError::NotConnected {
                    state: ConnectionState::Disconnected
                })
            ));
        }
        assert!(matches!(
            connector.reconnect().await,
            Err(LightClientError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn set_color_writes_single_line() {
        let (connector, mut server) = connected(&["A"]).await;
        let light = connector.lights().remove(0);

        connector
            .set_color(&light, Color::rgb(0.5, 0.2, 0.9))
            .await
            .unwrap();

        assert_eq!(
            server.next_command().await.as_deref(),
            Some("set light A rgb 0.5 0.2 0.9")
        );
        assert_eq!(connector.state(), ConnectionState::Ready);
        assert_eq!(
            connector.lights()[0].color(),
            Some(Color::rgb(0.5, 0.2, 0.9))
        );
    }

    #[tokio::test]
    async fn invalid_payloads_are_not_sent() {
        let (connector, mut server) = connected(&["A"]).await;
        let light = connector.lights().remove(0);

        for color in [
            Color::rgb(-0.1, 0.0, 0.0),
            Color::rgb(0.0, 1.1, 0.0),
            Color::rgb(0.0, 0.0, f64::NAN),
        ] {
            assert!(matches!(
                connector.set_color(&light, color).await,
                Err(LightClientError::Validation(_))
            ));
        }
        assert!(matches!(
            connector.set_speed(&light, 1.5).await,
            Err(LightClientError::Validation(_))
        ));
        assert!(matches!(
            connector.set_interpolation(&light, -1.0).await,
            Err(LightClientError::Validation(_))
        ));
        assert!(matches!(
            connector.set_priority(257).await,
            Err(LightClientError::Validation(_))
        ));

        connector.ping().await.unwrap();
        assert_eq!(server.next_command().await.as_deref(), Some("ping"));
        assert_eq!(connector.state(), ConnectionState::Ready);
        assert_eq!(connector.lights()[0].color(), None);
        assert_eq!(connector.priority(), 128);
    }

    #[tokio::test]
    async fn encodes_light_commands() {
        let (connector, mut server) = connected(&["A"]).await;
        let light = connector.lights().remove(0);

        connector.set_speed(&light, 0.25).await.unwrap();
        connector.set_interpolation(&light, 1.0).await.unwrap();
        connector.set_priority(10).await.unwrap();
        connector.sync().await.unwrap();

        assert_eq!(
            server.next_command().await.as_deref(),
            Some("set light A speed 0.25")
        );
        assert_eq!(
            server.next_command().await.as_deref(),
            Some("set light A interpolation 1")
        );
        assert_eq!(
            server.next_command().await.as_deref(),
            Some("set priority 10")
        );
        assert_eq!(server.next_command().await.as_deref(), Some("sync"));
        assert_eq!(connector.priority(), 10);
    }

    #[tokio::test]
    async fn lights_are_returned_as_copies() {
        let (connector, _server) = connected(&["A", "B"]).await;

        let mut first = connector.lights();
        let second = connector.lights();
        first.clear();
        first.push(Light::new("Z"));

        assert_eq!(second, vec![Light::new("A"), Light::new("B")]);
        assert_eq!(connector.lights(), second);
    }

    #[tokio::test]
    async fn reconnect_replaces_lights() {
        let (first, mut first_server) = FakeServer::spawn(Script::handshake(&["A", "B"]));
        let (second, mut second_server) = FakeServer::spawn(Script::handshake(&["C"]));
        let connector = Connector::with_opener(config(), FakeOpener::new([first, second]));
        connector.connect("localhost", 19333, 128).await.unwrap();
        first_server.skip_handshake().await;
        connector.set_priority(42).await.unwrap();
        assert_eq!(
            first_server.next_command().await.as_deref(),
            Some("set priority 42")
        );

        connector.reconnect().await.unwrap();

        assert_eq!(connector.state(), ConnectionState::Ready);
        assert_eq!(connector.lights(), vec![Light::new("C")]);
        assert_eq!(first_server.next_command().await, None);
        for expected in ["hello", "get version", "get lights", "set priority 42"] {
            assert_eq!(second_server.next_command().await.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn reconnect_goes_straight_to_connecting() {
        let (first, mut first_server) = FakeServer::spawn(Script::handshake(&["A"]));
        let (second, _second_server) = FakeServer::spawn(Script::handshake(&["A"]));
        let connector = Connector::with_opener(config(), FakeOpener::new([first, second]));
        connector.connect("localhost", 19333, 128).await.unwrap();
        first_server.skip_handshake().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut states = connector.subscribe();
        let recorder = tokio::spawn({
            let seen = seen.clone();
            async move {
                while states.changed().await.is_ok() {
                    let state = *states.borrow_and_update();
                    seen.lock().unwrap().push(state);
                }
            }
        });

        connector.reconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        recorder.abort();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&ConnectionState::Reconnecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Ready));
        assert!(!seen.contains(&ConnectionState::Closed), "{seen:?}");
    }

    #[tokio::test]
    async fn peer_hang_up_closes_connection() {
        let (connector, server) = connected(&["A"]).await;
        let mut states = connector.subscribe();

        server.hang_up();
        states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .unwrap();

        assert!(matches!(
            connector.ping().await,
            Err(LightClientError::NotConnected {
                state: ConnectionState::Closed
            })
        ));
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let (stream, _server) = FakeServer::spawn(Script::handshake(&["A"]));
        let config = config().with_idle_timeout(Some(Duration::from_millis(50)));
        let connector = Connector::with_opener(config, FakeOpener::new([stream]));
        connector.connect("localhost", 19333, 128).await.unwrap();
        let mut states = connector.subscribe();

        states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_cross() {
        let script = Script::handshake(&["A"])
            .reply("get lights", &["lights 2", "light B", "light C"])
            .reply("get lights", &["lights 1", "light D"]);
        let (stream, _server) = FakeServer::spawn(script);
        let connector = Connector::with_opener(config(), FakeOpener::new([stream]));
        connector.connect("localhost", 19333, 128).await.unwrap();

        let (first, second) = tokio::join!(connector.refresh_lights(), connector.refresh_lights());

        assert_eq!(first.unwrap(), vec![Light::new("B"), Light::new("C")]);
        assert_eq!(second.unwrap(), vec![Light::new("D")]);
        assert_eq!(connector.lights(), vec![Light::new("D")]);
    }

    #[tokio::test]
    async fn close_rejects_further_commands() {
        let (connector, mut server) = connected(&["A"]).await;

        connector.close().await;

        assert_eq!(connector.state(), ConnectionState::Closed);
        assert_eq!(server.next_command().await, None);
        assert!(matches!(
            connector.sync().await,
            Err(LightClientError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_priority() {
        let connector = Connector::with_opener(config(), FakeOpener::refusing());
        assert!(matches!(
            connector.connect("localhost", 19333, 300).await,
            Err(LightClientError::Validation(_))
        ));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }
}
