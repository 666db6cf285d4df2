//! snapsight: drag-select a region of a page, capture it, ask a vision model.
//!
//! Three contexts run as separate tokio tasks and talk only through
//! [`channel::RuntimeChannel`]:
//!   - page        - overlay/           selection gesture, one task per page load
//!   - background  - orchestrator/      router: toggle state, capture, analysis, handoff
//!   - window      - conversation.rs    follow-up questions on one captured image
//!
//! Supporting domains:
//!   - geometry.rs  - logical → device pixel crop rectangle
//!   - capture/     - grab, crop and size-budgeted encoding
//!   - llm/         - remote analysis client with local rate limit
//!   - browser.rs   - tab directory, also the capture source
//!   - handoff.rs   - local storage scope (handoff + usage stats)
//!   - settings.rs  - synced storage scope (credential) + env config
//!   - error.rs     - error taxonomy carried across contexts

pub mod browser;
pub mod capture;
pub mod channel;
pub mod cli;
pub mod conversation;
pub mod error;
pub mod geometry;
pub mod handoff;
pub mod llm;
pub mod orchestrator;
pub mod overlay;
pub mod settings;

use clap::Parser;

/// Entry point: called by the binary.
pub async fn run() -> Result<(), String> {
    // Load .env.local → .env from the working directory; first one found wins.
    'env_load: for env_file in [".env.local", ".env"] {
        let path = std::path::Path::new(env_file);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(_) => eprintln!("[STARTUP] Loaded {}", path.display()),
                Err(e) => eprintln!("[STARTUP] Failed to load {}: {}", path.display(), e),
            }
            break 'env_load;
        }
    }

    env_logger::init();

    let cli = cli::Cli::parse();
    cli::execute(cli).await
}
