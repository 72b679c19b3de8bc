//! Interactive stdin key handling: reload, stop, quit, and help, driven
//! by a `crossterm` raw-mode read loop.

use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::supervisor::Supervisor;

pub const HELP: &str = "keys: [r] reload  [s] stop all  [q] quit  [h] help";

/// Reads keys from stdin in raw mode until `q`/Ctrl-C, dispatching to the
/// supervisor. Runs on a blocking task since `crossterm::event::read` is
/// a blocking call.
pub async fn run(supervisor: Arc<Supervisor>) -> std::io::Result<()> {
    terminal::enable_raw_mode()?;
    info!("{HELP}");

    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        loop {
            if !event::poll(Duration::from_millis(200))? {
                continue;
            }
            if let Event::Key(key) = event::read()? {
                let quit = key.code == KeyCode::Char('q')
                    || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL));
                if quit {
                    return Ok(());
                }

                match key.code {
                    KeyCode::Char('r') => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move { supervisor.request_reload().await });
                    }
                    KeyCode::Char('s') => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move { supervisor.stop_all().await });
                    }
                    KeyCode::Char('h') => info!("{HELP}"),
                    _ => {}
                }
            }
        }
    })
    .await
    .expect("console task panicked");

    terminal::disable_raw_mode()?;
    result
}
