//! WebSocket transport for sessions and the wake word stream
//!
//! Each connection runs three tasks: a reader that pushes client frames
//! into a bounded [`InboundQueue`], a writer that drains an outbound
//! channel, and the handling loop that owns the protocol state and is the
//! only place it is mutated.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::ApiState;
use crate::pipeline::{DispatchEvent, DispatchHandle, PipelineEvent};
use crate::session::{
    Action, Inbound, InboundQueue, Input, Pushed, SessionProtocol, WakeWordListener,
};

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 8;

/// Sans-IO protocol a connection loop can drive
trait ConnectionProtocol: Send {
    fn greeting(&mut self) -> Vec<Action>;
    fn handle(&mut self, input: Input, now: Instant) -> Vec<Action>;
    fn is_closed(&self) -> bool;
}

impl ConnectionProtocol for SessionProtocol {
    fn greeting(&mut self) -> Vec<Action> {
        Self::greeting(self)
    }

    fn handle(&mut self, input: Input, now: Instant) -> Vec<Action> {
        Self::handle(self, input, now)
    }

    fn is_closed(&self) -> bool {
        Self::is_closed(self)
    }
}

impl ConnectionProtocol for WakeWordListener {
    fn greeting(&mut self) -> Vec<Action> {
        Self::greeting(self)
    }

    fn handle(&mut self, input: Input, now: Instant) -> Vec<Action> {
        Self::handle(self, input, now)
    }

    fn is_closed(&self) -> bool {
        Self::is_closed(self)
    }
}

/// Full session endpoint
async fn listen_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let protocol = SessionProtocol::new(Arc::clone(&state.detector), state.session.clone());
        handle_socket(socket, state, protocol, "session").await;
    })
}

/// Detection-only endpoint
async fn wakeword_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let listener = WakeWordListener::new(Arc::clone(&state.detector), state.session.debounce);
        handle_socket(socket, state, listener, "wakeword").await;
    })
}

async fn handle_socket<P: ConnectionProtocol>(
    socket: WebSocket,
    state: Arc<ApiState>,
    protocol: P,
    kind: &'static str,
) {
    tracing::info!(kind, "websocket connected");

    // First connection may load model assets from disk
    let detector = Arc::clone(&state.detector);
    if let Err(e) = tokio::task::spawn_blocking(move || detector.load().map(|_| ())).await {
        tracing::error!(error = %e, "detector load task failed");
    }

    let (sender, receiver) = socket.split();
    let queue = Arc::new(InboundQueue::new(
        state.session.frame_queue_depth,
        state.detector.frame_samples(),
    ));
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(write_outbound(sender, out_rx));
    let recv_task = tokio::spawn(read_inbound(receiver, Arc::clone(&queue)));

    let mut connection = Connection::new(Arc::clone(&state), out_tx);
    connection.run(protocol, &queue).await;

    recv_task.abort();
    // Dropping the sender lets the writer flush queued messages and exit
    drop(connection);
    let _ = send_task.await;

    tracing::info!(kind, dropped_audio_bytes = queue.dropped_bytes(), "websocket disconnected");
}

async fn read_inbound(mut receiver: SplitStream<WebSocket>, queue: Arc<InboundQueue>) {
    while let Some(msg) = receiver.next().await {
        let item = match msg {
            Ok(Message::Text(text)) => Inbound::Control(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => Inbound::Audio(bytes.to_vec()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "websocket read failed");
                break;
            }
        };
        if matches!(queue.push(item), Pushed::Overflow | Pushed::Closed) {
            break;
        }
    }
    queue.close();
}

async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sender.send(msg).await.is_err() || closing {
            break;
        }
    }
    let _ = sender.close().await;
}

/// IO side of one connection: executes protocol actions
struct Connection {
    state: Arc<ApiState>,
    out: mpsc::Sender<Message>,
    events_tx: mpsc::Sender<DispatchEvent>,
    events_rx: mpsc::Receiver<DispatchEvent>,
    dispatch: Option<DispatchHandle>,
}

impl Connection {
    fn new(state: Arc<ApiState>, out: mpsc::Sender<Message>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            state,
            out,
            events_tx,
            events_rx,
            dispatch: None,
        }
    }

    async fn run<P: ConnectionProtocol>(&mut self, mut protocol: P, queue: &InboundQueue) {
        let idle = self.state.session.idle_timeout;

        if !self.execute(protocol.greeting()).await {
            return;
        }

        let mut deadline = tokio::time::Instant::now() + idle;
        loop {
            let input = tokio::select! {
                inbound = queue.pop() => {
                    deadline = tokio::time::Instant::now() + idle;
                    match inbound {
                        Some(Inbound::Control(text)) => Input::Text(text),
                        Some(Inbound::Audio(bytes)) => Input::Audio(bytes),
                        Some(Inbound::Flooded) => Input::Flooded,
                        None => Input::Disconnect,
                    }
                }
                Some(event) = self.events_rx.recv() => Input::Pipeline(event),
                () = tokio::time::sleep_until(deadline) => Input::IdleTimeout,
            };

            let disconnected = matches!(input, Input::Disconnect);
            let actions = protocol.handle(input, Instant::now());
            let open = self.execute(actions).await;

            if disconnected || !open || protocol.is_closed() {
                break;
            }
        }

        if let Some(handle) = self.dispatch.take() {
            handle.abort();
        }
    }

    /// Run actions in order; `false` once the connection must close
    async fn execute(&mut self, actions: Vec<Action>) -> bool {
        for action in actions {
            match action {
                Action::Send(message) => match message.to_json() {
                    Ok(text) => {
                        if self.out.send(Message::Text(text.into())).await.is_err() {
                            return false;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode server message"),
                },
                Action::SendAudio(bytes) => {
                    if self.out.send(Message::Binary(bytes.into())).await.is_err() {
                        return false;
                    }
                }
                Action::Dispatch {
                    ticket,
                    utterance,
                    context,
                } => {
                    let started = self.state.dispatcher.start(
                        ticket,
                        utterance,
                        context,
                        self.events_tx.clone(),
                    );
                    match started {
                        Ok(handle) => self.dispatch = Some(handle),
                        Err(e) => {
                            // Fed back so the protocol reports it and releases the guard
                            let event = DispatchEvent {
                                ticket,
                                event: PipelineEvent::Failed(e),
                            };
                            if let Err(e) = self.events_tx.try_send(event) {
                                tracing::error!(error = %e, ticket, "failed to queue dispatch rejection");
                            }
                        }
                    }
                }
                Action::CancelDispatch => {
                    if let Some(handle) = self.dispatch.take() {
                        tracing::debug!(ticket = handle.ticket(), "cancelling dispatch");
                        handle.abort();
                    }
                }
                Action::Close => {
                    let _ = self.out.send(Message::Close(None)).await;
                    return false;
                }
            }
        }
        true
    }
}

/// WebSocket routes, nested under `/ws`
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/listen", get(listen_upgrade))
        .route("/wakeword", get(wakeword_upgrade))
        .with_state(state)
}
