//! Server-side request dispatch
//!
//! - [`Servant`]: the upcall target
//! - [`Dispatcher`]: admission, lookup and upcall for one request
//! - [`current`]: the upcall context of the calling thread

pub mod current;
pub mod dispatcher;
pub mod servant;

pub use dispatcher::{DispatchStats, DispatchStatsSnapshot, Dispatcher, LocateStatus};
pub use servant::{
    Etherealizer, Servant, ServantHandle, ServantId, UpcallOutcome, UpcallResult,
};
