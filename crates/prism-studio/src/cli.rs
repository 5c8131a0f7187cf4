use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "prism-studio", version, about = "Switch between GPU demo scenes")]
pub struct Cli {
    /// Scene to mount at startup (see `--list`).
    #[arg(long, value_name = "ID")]
    pub scene: Option<String>,

    /// Print the scene catalog and exit.
    #[arg(long)]
    pub list: bool,

    /// Log filter in `env_logger` syntax (e.g. `debug` or `prism_engine=trace`).
    #[arg(long, value_name = "FILTER")]
    pub log: Option<String>,

    /// Initial window width in logical pixels.
    #[arg(long, default_value_t = 1280.0)]
    pub width: f64,

    /// Initial window height in logical pixels.
    #[arg(long, default_value_t = 720.0)]
    pub height: f64,

    /// Adapter preference passed to every scene's device request.
    #[arg(long, value_enum, default_value_t = Power::High)]
    pub power: Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Power {
    Low,
    High,
    /// Let the driver decide.
    None,
}

impl From<Power> for wgpu::PowerPreference {
    fn from(power: Power) -> Self {
        match power {
            Power::Low => wgpu::PowerPreference::LowPower,
            Power::High => wgpu::PowerPreference::HighPerformance,
            Power::None => wgpu::PowerPreference::None,
        }
    }
}
