#![forbid(unsafe_code)]

mod session;
mod transport;
mod typing;

pub use session::{SessionController, SessionError, SessionStatus};
pub use transport::{
    ApiRequest, ApiResponse, AuthSession, AuthenticatedUser, HttpTransport, SessionTransport,
    TransportError,
};
pub use typing::{typing_frame, TypingDebounce, TypingSignal, TypingTarget, TYPING_IDLE_INTERVAL};
