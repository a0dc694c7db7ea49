use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "jukebox", version)]
pub struct Args {
    /// Tracks to queue at startup
    pub tracks: Vec<PathBuf>,

    /// Initial gain (0.0 to 1.0)
    #[arg(long)]
    pub gain: Option<f64>,

    /// ffmpeg binary used for decoding
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,
}
