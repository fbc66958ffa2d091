// Melodown - Music Player & Downloader
// Copyright (C) 2025 Melodown contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Desktop testing CLI for the download queue

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use melodown::storage::{Database, SqliteStateStore};
use melodown::{
    DownloadConfig, DownloadQueue, HttpResolver, Quality, QueueEvent, TaskStatus, TrackMeta,
};

#[derive(Parser, Debug)]
#[command(name = "melodown-cli", about = "Queue downloads against a lookup API")]
struct Args {
    /// Base URL of the resource lookup API
    #[arg(long)]
    api_base: Url,

    /// Opaque credential cookie passed to the lookup API and CDN
    #[arg(long)]
    cookie: Option<String>,

    /// Output directory for finished files
    #[arg(long, default_value = ".")]
    out: PathBuf,

    /// Queue database path
    #[arg(long, default_value = "melodown-queue.db")]
    db: PathBuf,

    /// Requested quality (128 | 192 | 320 | flac)
    #[arg(long, default_value = "320")]
    quality: Quality,

    /// Maximum concurrent downloads
    #[arg(long, default_value_t = 2)]
    concurrency: usize,

    /// Resource ids to download
    #[arg(required = true)]
    resources: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "melodown=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = DownloadConfig {
        max_concurrent: args.concurrency,
        staging_directory: args.out.join(".staging"),
        music_directory: args.out.clone(),
        ..Default::default()
    };

    let resolver = Arc::new(HttpResolver::new(
        args.api_base,
        args.cookie.clone(),
        config.resolve_retries,
        config.resolve_retry_delay,
    )?);

    let database = Database::new(&args.db)
        .await
        .context("opening queue database")?;
    let state = Arc::new(SqliteStateStore::new(database.pool().clone()));

    let mut builder = DownloadQueue::builder(config, resolver, state);
    if let Some(cookie) = args.cookie {
        builder = builder.credential(cookie);
    }
    let queue = builder.open().await?;

    let mut events = queue.subscribe();
    let mut task_ids = Vec::new();
    for resource_id in &args.resources {
        let track = TrackMeta {
            resource_id: resource_id.clone(),
            title: resource_id.clone(),
            artist: "unknown".to_string(),
            duration_secs: 0,
        };
        let task_id = queue.add_task(track, args.quality).await?;
        println!("queued {resource_id} as {task_id}");
        task_ids.push(task_id);
    }

    // Follow events until every queued task settles
    loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(QueueEvent::StatusChanged {
                task_id,
                status,
                error,
            })) => match status {
                TaskStatus::Completed => println!("{task_id}: completed"),
                TaskStatus::Error => {
                    println!("{task_id}: failed ({})", error.unwrap_or_default())
                }
                other => println!("{task_id}: {}", other.as_str()),
            },
            Ok(Ok(QueueEvent::ProgressUpdated {
                task_id,
                bytes_loaded,
                total_bytes,
            })) => {
                if total_bytes > 0 {
                    println!(
                        "{task_id}: {:.1}% ({bytes_loaded}/{total_bytes})",
                        bytes_loaded as f64 / total_bytes as f64 * 100.0
                    );
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
            Ok(Err(_)) => {} // lagged; the settled check below still fires
            Err(_) => {}     // tick: fall through to the settled check
        }

        let settled = task_ids
            .iter()
            .all(|id| queue.task(id).map(|t| t.is_terminal()).unwrap_or(true));
        if settled {
            break;
        }
    }

    let completed = queue.tasks_with_status(TaskStatus::Completed).len();
    println!("done: {completed}/{} completed", task_ids.len());
    Ok(())
}
