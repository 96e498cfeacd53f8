//! CLI command implementations.
//!
//! | Module     | Commands handled      |
//! |------------|-----------------------|
//! | `serve`    | `Serve`               |
//! | `pipeline` | `Run`                 |
//! | `queue`    | `Enqueue`, `Status`   |

pub mod pipeline;
pub mod queue;
pub mod serve;

pub use pipeline::cmd_run;
pub use queue::{cmd_enqueue, cmd_status};
pub use serve::cmd_serve;
