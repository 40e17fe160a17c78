//! # Relay Session State Machine
//!
//! One relay session pairs a client WebSocket with exactly one upstream
//! voice-service WebSocket for the session's whole lifetime — no upstream
//! multiplexing, no reuse across sessions, and the session never outlives
//! both endpoints.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: client socket accepted, no upstream connection yet
//! 2. **AwaitingUpstream**: upstream handshake in flight
//! 3. **Active**: both legs open, messages pass through verbatim
//! 4. **Closed**: either side closed or errored; the other side is torn down
//!
//! Transitions are pure functions of `(state, event)` returning the new state
//! and the effects to execute, so the same machine can be driven from an
//! actor, a task-and-channel loop, or a test table. The caller executes the
//! effects; the machine never touches a socket.

/// Lifecycle state of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Client socket accepted, upstream connect not yet started
    Idle,
    /// Upstream handshake in flight
    AwaitingUpstream,
    /// Both legs open; forwarding in both directions
    Active,
    /// Terminal: one side went away and the other has been told to follow
    Closed,
}

/// One WebSocket payload, either leg. Text is the protocol's native form;
/// binary frames are forwarded with the same transparency.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Everything that can happen to a relay session.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The client connection finished its handshake
    DownstreamConnected,
    /// The upstream connection finished its handshake
    UpstreamConnected,
    /// The upstream connect attempt failed before the handshake completed
    UpstreamConnectFailed(String),
    /// A payload arrived from the client
    DownstreamFrame(Frame),
    /// A payload arrived from the upstream service
    UpstreamFrame(Frame),
    /// The client closed its connection
    DownstreamClosed,
    /// The client connection failed
    DownstreamFailed(String),
    /// The upstream service closed its connection
    UpstreamClosed,
    /// The upstream connection failed mid-call
    UpstreamFailed(String),
}

/// Side effects the caller must execute after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the upstream connection for this session
    ConnectUpstream,
    /// Send the one-shot session configuration upstream
    SendSessionConfig,
    /// Forward a payload to the upstream leg verbatim
    ForwardUpstream(Frame),
    /// Forward a payload to the client leg verbatim
    ForwardDownstream(Frame),
    /// Send an `error` envelope to the client
    NotifyDownstreamError(String),
    /// Tear down the upstream leg
    CloseUpstream,
    /// Tear down the client leg
    CloseDownstream,
    /// Discard a payload that arrived while the opposite leg was not open
    DropFrame,
}

/// Apply one event to the session, returning the next state and the effects
/// to execute.
///
/// ## Guarantees encoded here:
/// - `SendSessionConfig` is emitted only on the `AwaitingUpstream → Active`
///   edge, so the configuration goes out exactly once per session
/// - frames that arrive before the opposite leg is open produce `DropFrame`,
///   never buffering and never a crash
/// - closure of either leg always produces the close of the other
/// - every event in `Closed` is inert
pub fn transition(state: RelayState, event: RelayEvent) -> (RelayState, Vec<Effect>) {
    use Effect::*;
    use RelayEvent::*;
    use RelayState::*;

    match (state, event) {
        (Idle, DownstreamConnected) => (AwaitingUpstream, vec![ConnectUpstream]),

        (AwaitingUpstream, UpstreamConnected) => (Active, vec![SendSessionConfig]),

        (AwaitingUpstream, UpstreamConnectFailed(reason)) => (
            Closed,
            vec![NotifyDownstreamError(reason), CloseDownstream],
        ),

        // Client is allowed to talk immediately; anything sent before the
        // upstream leg is open is discarded, not queued.
        (Idle, DownstreamFrame(_)) | (AwaitingUpstream, DownstreamFrame(_)) => {
            (state, vec![DropFrame])
        }

        (Active, DownstreamFrame(frame)) => (Active, vec![ForwardUpstream(frame)]),

        (Active, UpstreamFrame(frame)) => (Active, vec![ForwardDownstream(frame)]),

        // Client going away tears down the upstream leg, whatever phase the
        // upstream handshake is in.
        (Idle, DownstreamClosed) | (Idle, DownstreamFailed(_)) => (Closed, vec![]),
        (AwaitingUpstream, DownstreamClosed)
        | (AwaitingUpstream, DownstreamFailed(_))
        | (Active, DownstreamClosed)
        | (Active, DownstreamFailed(_)) => (Closed, vec![CloseUpstream]),

        // Upstream going away tears down the client leg. A clean upstream
        // close is passed along as a close; a failure also tells the client
        // why before closing.
        (AwaitingUpstream, UpstreamClosed) | (Active, UpstreamClosed) => {
            (Closed, vec![CloseDownstream])
        }
        (AwaitingUpstream, UpstreamFailed(reason)) | (Active, UpstreamFailed(reason)) => (
            Closed,
            vec![NotifyDownstreamError(reason), CloseDownstream],
        ),

        // A duplicate ready signal must not re-send the session config.
        (Active, UpstreamConnected) => (Active, vec![]),

        // Frames from a leg that should not be producing them yet.
        (Idle, UpstreamFrame(_)) | (AwaitingUpstream, UpstreamFrame(_)) => {
            (state, vec![DropFrame])
        }

        // Closed is terminal: late events are inert, late frames are dropped.
        (Closed, DownstreamFrame(_)) | (Closed, UpstreamFrame(_)) => (Closed, vec![DropFrame]),
        (Closed, _) => (Closed, vec![]),

        // Remaining combinations (e.g. upstream signals while Idle) have no
        // live upstream leg to act on.
        (Idle, UpstreamConnected)
        | (Idle, UpstreamConnectFailed(_))
        | (Idle, UpstreamClosed)
        | (Idle, UpstreamFailed(_)) => (Idle, vec![]),

        (AwaitingUpstream, DownstreamConnected) | (Active, DownstreamConnected) => {
            (state, vec![])
        }

        (Active, UpstreamConnectFailed(reason)) => (
            Closed,
            vec![NotifyDownstreamError(reason), CloseDownstream],
        ),
    }
}
