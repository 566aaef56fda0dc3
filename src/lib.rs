//! auxguard - speaker keep-alive engine with wired-route disconnect alarm
//!
//! Keeps a wired audio output awake by playing a continuous, near-inaudible
//! pink-noise signal, and raises a pulsing siren if the output route is
//! lost while the keep-alive is active. The UI layer is an external
//! collaborator: it drives a [`session::SessionHandle`] and renders the
//! [`session::SessionEvent`] stream; everything audible lives in here.

pub mod audio;
pub mod session;

pub use audio::device::{AudioConfig, AudioDeviceInfo};
pub use audio::route::RouteEvent;
pub use audio::spectrum::NUM_BANDS;
pub use session::{
    spawn, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionState,
};
