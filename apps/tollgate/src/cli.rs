use clap::Parser;

/// Command-line entry point. Every flag also has an environment fallback so
/// the binary can run unmodified in a container that only sets env vars.
#[derive(Parser)]
#[command(name = "tollgate")]
pub struct Cli {
    #[arg(long, env = "CONFIG_PATH", default_value = "config.json")]
    pub config: String,
    #[arg(long, env = "HOST")]
    pub host: Option<String>,
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}
