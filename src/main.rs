mod cache;
mod cancel;
mod cli;
mod coordinator;
mod error;
mod files;
mod loader;
mod paths;
mod ui;

use clap::Parser;
use std::sync::Arc;
use winit::event_loop::EventLoop;

use crate::cli::Cli;
use crate::coordinator::Coordinator;
use crate::loader::ImageCrateDecoder;
use crate::ui::{App, ProxyWaker, UserEvent, WindowSink};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match cli.viewer_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(2);
        }
    };

    let event_loop = EventLoop::<UserEvent>::with_user_event().build().expect("create event loop");
    let waker = Arc::new(ProxyWaker::new(event_loop.create_proxy()));

    let mut coordinator = match Coordinator::new(
        config,
        Arc::new(ImageCrateDecoder),
        WindowSink::default(),
        waker,
    ) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    match &cli.path {
        Some(path) => {
            coordinator.open(path);
        }
        None => log::info!("No image given; drop one onto the window."),
    }

    let mut app = App::new(coordinator);
    event_loop.run_app(&mut app).expect("run event loop");
}
