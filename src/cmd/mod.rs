//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module          | Commands handled |
//! |-----------------|------------------|
//! | `escalations`   | `Escalations`    |
//! | `state`         | `State`          |
//! | `decisions`     | `Decisions`      |
//! | `config`        | `Config`         |

pub mod config;
pub mod decisions;
pub mod escalations;
pub mod state;

pub use config::cmd_config;
pub use decisions::cmd_decisions;
pub use escalations::cmd_escalations;
pub use state::cmd_state;

/// Shorten `text` to at most `max` characters, marking the cut with `...`.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let kept: String = single_line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
