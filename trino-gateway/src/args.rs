use std::path::PathBuf;

use clap::Parser;

/// Routing gateway in front of a fleet of Trino coordinators
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file that contains needed information to start trino-gateway.
    #[arg(short, long)]
    pub config_file: PathBuf,
}
