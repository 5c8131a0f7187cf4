mod cli;

use clap::Parser;
use prism_engine::logging::{init_logging, LoggingConfig};
use prism_engine::window::{Runtime, RuntimeConfig};
use prism_scenes::SceneSettings;
use winit::dpi::LogicalSize;

use cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let scenes = prism_scenes::catalog(SceneSettings {
        power_preference: cli.power.into(),
    });

    if cli.list {
        for (index, scene) in scenes.iter().enumerate() {
            println!("{}  {:<14} {}", index + 1, scene.id(), scene.title());
        }
        return Ok(());
    }

    init_logging(LoggingConfig {
        env_filter: cli.log,
        ..LoggingConfig::default()
    });

    if let Some(id) = &cli.scene {
        if !scenes.iter().any(|scene| scene.id() == id) {
            log::warn!("unknown scene `{id}`; the default scene will be shown");
        }
    }

    let config = RuntimeConfig {
        title: "prism studio".to_string(),
        initial_size: LogicalSize::new(cli.width, cli.height),
        initial_scene: cli.scene,
        ..RuntimeConfig::default()
    };

    log::info!("starting with {} scenes", scenes.len());
    Runtime::run(config, scenes)
}
