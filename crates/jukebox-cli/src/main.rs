//! Interactive jukebox: queue files on the command line, then drive
//! playback from a line-oriented stdin prompt.

mod cli;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use jukebox::{cpal_player, Jukebox, PlaylistItem};
use jukebox_transcode::FfmpegTranscoder;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let transcoder = Arc::new(FfmpegTranscoder::new(args.ffmpeg.clone()));
    let jukebox = Arc::new(Jukebox::new(transcoder, cpal_player)?);

    {
        let jukebox = jukebox.clone();
        thread::spawn(move || jukebox.decode_stream());
    }
    {
        let jukebox = jukebox.clone();
        let _ = ctrlc::set_handler(move || {
            jukebox.quit();
            std::process::exit(130);
        });
    }

    if let Some(gain) = args.gain {
        jukebox.set_gain(gain);
    }
    let mut next_id = args.tracks.len() as i64;
    if !args.tracks.is_empty() {
        tracing::info!(count = args.tracks.len(), "queueing startup tracks");
        jukebox.set_items(queue_items(&args.tracks, 0));
        jukebox.play();
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if !handle_command(&jukebox, line.trim(), &mut next_id) {
            break;
        }
    }

    jukebox.quit();
    Ok(())
}

fn queue_items(paths: &[PathBuf], first_id: i64) -> Vec<PlaylistItem> {
    paths
        .iter()
        .enumerate()
        .map(|(i, path)| PlaylistItem::new(first_id + i as i64, path.clone()))
        .collect()
}

/// Dispatch one prompt line; returns false when the session should end.
fn handle_command(jukebox: &Jukebox, line: &str, next_id: &mut i64) -> bool {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return true;
    };

    match cmd {
        "status" => {
            let status = jukebox.get_status();
            println!(
                "track {} position {}s playing {} gain {}",
                status.current_index, status.position_secs, status.playing, status.gain
            );
        }
        "items" => {
            for (i, item) in jukebox.get_items().iter().enumerate() {
                println!("{i:3} [{}] {}", item.id(), item.path().display());
            }
        }
        "play" => jukebox.play(),
        "pause" => jukebox.pause(),
        "next" => jukebox.cancel_decode(),
        "skip" => {
            let index = parts.next().and_then(|v| v.parse::<usize>().ok());
            let offset = parts.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
            match index {
                Some(index) => jukebox.skip(index, offset),
                None => println!("usage: skip <index> [secs]"),
            }
        }
        "gain" => match parts.next().and_then(|v| v.parse::<f64>().ok()) {
            Some(gain) => jukebox.set_gain(gain),
            None => println!("usage: gain <value>"),
        },
        "add" => {
            let items = collect_items(parts, next_id);
            if items.is_empty() {
                println!("usage: add <path>..");
            } else {
                jukebox.append_items(items);
            }
        }
        "set" => {
            let items = collect_items(parts, next_id);
            if items.is_empty() {
                println!("usage: set <path>..");
            } else {
                jukebox.set_items(items);
                jukebox.play();
            }
        }
        "remove" => match parts.next().and_then(|v| v.parse::<usize>().ok()) {
            Some(index) => jukebox.remove_item(index),
            None => println!("usage: remove <index>"),
        },
        "clear" => jukebox.clear_items(),
        "quit" | "exit" => return false,
        _ => println!(
            "commands: status items play pause next skip <i> [secs] \
             gain <v> add <path>.. set <path>.. remove <i> clear quit"
        ),
    }
    true
}

fn collect_items<'a>(paths: impl Iterator<Item = &'a str>, next_id: &mut i64) -> Vec<PlaylistItem> {
    paths
        .map(|path| {
            let item = PlaylistItem::new(*next_id, path);
            *next_id += 1;
            item
        })
        .collect()
}
