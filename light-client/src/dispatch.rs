use std::{collections::VecDeque, sync::Arc};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    connector::ConnectionState,
    protocol::{LightEnumeration, Response, ResponseShape},
    transport::TransportEvent,
    LightClientError,
};

pub(crate) type Reply = oneshot::Sender<Result<Response, LightClientError>>;

/// A request waiting for its response.
pub(crate) struct PendingRequest {
    command: String,
    progress: Progress,
    reply: Reply,
}

enum Progress {
    SingleLine,
    Lights(LightEnumeration),
}

impl PendingRequest {
    pub fn new(
        command: String,
        shape: ResponseShape,
    ) -> (Self, oneshot::Receiver<Result<Response, LightClientError>>) {
        let (reply, receiver) = oneshot::channel();
        let progress = match shape {
            ResponseShape::SingleLine => Progress::SingleLine,
            ResponseShape::LightEnumeration => Progress::Lights(LightEnumeration::default()),
        };
        (
            Self {
                command,
                progress,
                reply,
            },
            receiver,
        )
    }

    fn complete(self, result: Result<Response, LightClientError>) {
        if self.reply.send(result).is_err() {
            debug!("Nobody is waiting for the response to `{}` anymore", self.command);
        }
    }
}

enum Closure {
    /// The connector closed the transport and publishes the next state itself.
    Local,
    Closed,
    Failed(String),
    Idle,
    Protocol(String),
}

impl Closure {
    fn error_for(&self, request: &PendingRequest) -> LightClientError {
        match self {
            Closure::Local | Closure::Closed => LightClientError::ConnectionClosed,
            Closure::Failed(reason) => LightClientError::ConnectionFailed {
                reason: reason.clone(),
            },
            Closure::Idle => LightClientError::Timeout {
                command: request.command.clone(),
            },
            Closure::Protocol(reason) => LightClientError::Protocol {
                reason: reason.clone(),
            },
        }
    }
}

/// Matches transport events against pending requests, one connection's worth.
///
/// Requests are resolved strictly in the order they were queued. When the
/// transport goes away every pending request is failed and, unless the
/// connector closed it, the connection state moves to
/// [`ConnectionState::Closed`]. A server that breaks the protocol outside of
/// any request closes the connection too; that violation is returned.
pub(crate) async fn run(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut requests: mpsc::UnboundedReceiver<PendingRequest>,
    state: Arc<watch::Sender<ConnectionState>>,
) -> Option<LightClientError> {
    let mut queue = VecDeque::new();
    // set between the last line of a light list and the next line or request
    let mut light_list_ended = false;

    let closure = loop {
        tokio::select! {
            // a request is always queued before its command is written, so
            // taking requests first keeps a fast reply from looking unsolicited
            biased;
            Some(request) = requests.recv() => {
                light_list_ended = false;
                queue.push_back(request);
            }
            event = events.recv() => match event {
                Some(TransportEvent::Line(line)) => {
                    if light_list_ended && queue.is_empty() && is_light(&line) {
                        error!("Boblight server sent more lights than it announced: {line}");
                        break Closure::Protocol(format!(
                            "more lights than announced, got {line:?}"
                        ));
                    }
                    light_list_ended = handle_line(&mut queue, line);
                }
                Some(TransportEvent::IdleTimeout) => {
                    warn!("Boblight server has been idle for too long, closing");
                    break Closure::Idle;
                }
                Some(TransportEvent::Error(reason)) => break Closure::Failed(reason),
                Some(TransportEvent::ClosedLocally) => break Closure::Local,
                Some(TransportEvent::ClosedByPeer) | None => break Closure::Closed,
            },
        }
    };

    if !matches!(closure, Closure::Local) {
        state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                info!("Connection state: {state} -> Closed");
                *state = ConnectionState::Closed;
                true
            }
        });
    }

    requests.close();
    while let Ok(request) = requests.try_recv() {
        queue.push_back(request);
    }
    for request in queue {
        let error = closure.error_for(&request);
        request.complete(Err(error));
    }

    match closure {
        Closure::Protocol(reason) => Some(LightClientError::Protocol { reason }),
        _ => None,
    }
}

fn is_light(line: &str) -> bool {
    line.split_whitespace().next() == Some("light")
}

/// Returns whether the line completed a light list.
fn handle_line(queue: &mut VecDeque<PendingRequest>, line: String) -> bool {
    let Some(request) = queue.front_mut() else {
        warn!("Ignoring unsolicited line from boblight server: {line}");
        return false;
    };

    let outcome = match &mut request.progress {
        Progress::SingleLine => Some(Ok(Response::Line(line))),
        Progress::Lights(enumeration) => match enumeration.feed(&line) {
            Ok(Some(lights)) => Some(Ok(Response::Lights(lights))),
            Ok(None) => None,
            Err(e) => {
                error!("Invalid response to `{}`: {e}", request.command);
                Some(Err(e))
            }
        },
    };

    let Some(outcome) = outcome else {
        return false;
    };
    let light_list = matches!(outcome, Ok(Response::Lights(_)));
    if let Some(request) = queue.pop_front() {
        request.complete(outcome);
    }
    light_list
}
