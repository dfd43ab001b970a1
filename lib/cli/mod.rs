use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, ValueEnum)]
pub enum StoreBackend {
    Craq,
    Redis,
}

#[derive(Parser, Debug)]
#[clap(about = "Object-to-server directory node for a partitioned space cluster")]
pub struct Cli {
    #[clap(long, value_enum, default_value = "craq")]
    /// Which backing store implementation to run against
    pub backend: StoreBackend,

    #[clap(long)]
    /// Override OSEG_SERVER_ID from the environment
    pub server_id: Option<u32>,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
