mod service;
mod settings;

use std::time::Duration;

use cache::ContentId;
use clap::{Parser, Subcommand};

use crate::service::{open_cache, TextureService};
use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a configuration file, taking precedence over `config/`
    #[arg(long, value_name = "PATH")]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch textures over HTTP into the cache
    Fetch {
        /// Texture URL, `{id}` is replaced by each texture id
        url_template: String,
        #[arg(required = true)]
        ids: Vec<ContentId>,
        /// Give up on textures still pending after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Print cache occupancy and counters
    Stats,
    /// Evict the oldest textures until the cache is under its purge threshold
    Purge {
        /// Also check body files of a slice of the entries against their recorded sizes
        #[arg(long)]
        validate: bool,
    },
    /// Drop all cached textures
    Clear,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::new(args.config_path)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.as_str()),
    )
    .init();
    settings.validate_and_warn();

    #[cfg(feature = "service_debug")]
    spawn_deadlock_detector();

    match args.command {
        Command::Fetch {
            url_template,
            ids,
            timeout_secs,
        } => {
            let service = TextureService::new(&settings)?;
            let statuses = service.fetch(&url_template, &ids, Duration::from_secs(timeout_secs));
            for (id, status) in statuses {
                match (&status.raster, status.state) {
                    (Some(raster), _) => println!(
                        "{id}: {} bytes at discard level {}",
                        raster.data.len(),
                        status.discard_level
                    ),
                    (None, Some(state)) if !status.done => println!("{id}: pending in {state}"),
                    (None, _) => match status.last_http_status {
                        Some(code) => println!("{id}: failed, HTTP {code}"),
                        None => println!("{id}: failed"),
                    },
                }
            }
            let stats = service.cache().stats();
            log::info!(
                "Cache holds {} textures, {} body bytes",
                stats.entries,
                stats.body_bytes
            );
            service.shutdown();
        }
        Command::Stats => {
            let cache = open_cache(&settings)?;
            let stats = cache.stats();
            println!("entries:           {} / {}", stats.entries, stats.max_entries);
            println!(
                "body bytes:        {} / {}",
                stats.body_bytes, stats.max_body_bytes
            );
            println!("pending deletions: {}", stats.pending_deletions);
            cache.shutdown();
        }
        Command::Purge { validate } => {
            let cache = open_cache(&settings)?;
            let evicted = cache.purge(validate)?;
            cache.process_deletions(true);
            println!("evicted {evicted} textures");
            cache.shutdown();
        }
        Command::Clear => {
            let cache = open_cache(&settings)?;
            cache.clear()?;
            cache.process_deletions(true);
            println!("cache cleared");
            cache.shutdown();
        }
    }
    Ok(())
}

#[cfg(feature = "service_debug")]
fn spawn_deadlock_detector() {
    use std::thread;

    use parking_lot::deadlock;

    const DEADLOCK_CHECK_PERIOD: Duration = Duration::from_secs(10);

    thread::spawn(move || loop {
        thread::sleep(DEADLOCK_CHECK_PERIOD);
        let deadlocks = deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        let mut error = format!("{} deadlocks detected\n", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            error.push_str(&format!("Deadlock #{i}\n"));
            for t in threads {
                error.push_str(&format!(
                    "Thread Id {:#?}\n{:#?}\n",
                    t.thread_id(),
                    t.backtrace()
                ));
            }
        }
        log::error!("{error}");
    });
}
