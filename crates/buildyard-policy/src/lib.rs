//! buildyard-policy — worker selection strategies.
//!
//! A builder asks its policy for one worker out of the currently
//! available set. The policy variants are a closed set rather than
//! arbitrary callables:
//!
//! - [`SelectionPolicy::Default`] — uniform-random choice
//! - [`SelectionPolicy::Preferred`] — affinity list first, random rest
//! - [`SelectionPolicy::Floating`] — primary workers strictly
//!   preferred, floating backups only after the primaries have been
//!   offline past a grace period (timer-driven re-evaluation)
//! - [`SelectionPolicy::Custom`] — escape hatch closure

pub mod floating;
pub mod selection;

pub use floating::{FloatingConfig, FloatingPolicy, NotifyFn, TimerHandle};
pub use selection::{CustomChooser, PolicyError, SelectionPolicy};
