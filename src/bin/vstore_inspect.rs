use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vobjstore::{DurableKindDescriptor, KvSnapshot, SnapshotManager};

#[derive(Parser)]
#[command(name = "vstore-inspect")]
#[command(about = "Read-only inspection of a vobjstore key-value snapshot")]
struct Cli {
    /// Snapshot file written by SnapshotManager
    #[arg(long)]
    snapshot: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Key counts per area plus the id counters
    Summary,
    /// Stored-data reference counts
    Refcounts,
    /// Export status of every exported stored object
    Exports,
    /// Collections with their labels and entry counts
    Collections,
    /// Durable and virtual kind descriptors
    Kinds,
    /// Raw entries, optionally restricted to a key prefix
    Dump {
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let snapshot = load_snapshot(&cli.snapshot)?;
    let entries = &snapshot.entries;

    match cli.command {
        Command::Summary => summary(entries),
        Command::Refcounts => {
            for (base_ref, count) in with_prefix(entries, "vom.rc.") {
                println!("{:<24} {}", base_ref, count);
            }
            Ok(())
        }
        Command::Exports => {
            for (base_ref, status) in with_prefix(entries, "vom.es.") {
                println!("{:<24} {}", base_ref, status);
            }
            Ok(())
        }
        Command::Collections => collections(entries),
        Command::Kinds => kinds(entries),
        Command::Dump { prefix } => {
            for (key, value) in with_prefix(entries, &prefix) {
                println!("{}{} = {}", prefix, key, value);
            }
            Ok(())
        }
    }
}

fn load_snapshot(path: &Path) -> Result<KvSnapshot> {
    SnapshotManager::new(path)
        .load()
        .with_context(|| format!("Failed to read snapshot '{}'", path.display()))?
        .ok_or_else(|| anyhow!("No snapshot at '{}'", path.display()))
}

/// Entries under `prefix`, with the prefix stripped from each key.
fn with_prefix<'a>(
    entries: &'a BTreeMap<String, String>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    entries
        .range(prefix.to_string()..)
        .take_while(move |(key, _)| key.starts_with(prefix))
        .map(move |(key, value)| (&key[prefix.len()..], value.as_str()))
}

fn summary(entries: &BTreeMap<String, String>) -> Result<()> {
    let areas = [
        ("collection entries", "vc."),
        ("refcounts", "vom.rc."),
        ("export statuses", "vom.es."),
        ("recognizers", "vom.ir."),
        ("durable kinds", "vom.dkind."),
        ("virtual kinds", "vom.vkind."),
    ];
    println!("{} keys total", entries.len());
    for (name, prefix) in areas {
        println!("{:<20} {}", name, with_prefix(entries, prefix).count());
    }
    for key in ["idCounters", "kindIDID", "storeKindIDTable", "baggageID"] {
        match entries.get(key) {
            Some(value) => println!("{:<20} {}", key, value),
            None => println!("{:<20} (unset)", key),
        }
    }
    Ok(())
}

fn collections(entries: &BTreeMap<String, String>) -> Result<()> {
    let mut found: BTreeMap<u64, (Option<&str>, Option<&str>)> = BTreeMap::new();
    for (rest, value) in with_prefix(entries, "vc.") {
        let Some((id, suffix)) = rest.split_once('.') else {
            continue;
        };
        let id: u64 = id
            .parse()
            .with_context(|| format!("Bad collection id in key 'vc.{}'", rest))?;
        let slot = found.entry(id).or_default();
        match suffix {
            "|label" => slot.0 = Some(value),
            "|entryCount" => slot.1 = Some(value),
            _ => {}
        }
    }
    for (id, (label, count)) in found {
        println!(
            "{:<6} {:<24} {}",
            id,
            label.unwrap_or("?"),
            count.unwrap_or("(weak)")
        );
    }
    Ok(())
}

fn kinds(entries: &BTreeMap<String, String>) -> Result<()> {
    for (rest, value) in with_prefix(entries, "vom.dkind.") {
        if !rest.ends_with(".descriptor") {
            continue;
        }
        let desc: DurableKindDescriptor = serde_json::from_str(value)
            .with_context(|| format!("Bad descriptor 'vom.dkind.{}'", rest))?;
        let shape = match (&desc.unfaceted, &desc.facets) {
            (Some(true), _) => "unfaceted".to_string(),
            (_, Some(facets)) => format!("facets [{}]", facets.join(",")),
            _ => "not yet defined".to_string(),
        };
        let next_id = entries
            .get(&DurableKindDescriptor::next_id_key(desc.kind_id))
            .map(String::as_str)
            .unwrap_or("?");
        println!(
            "durable {:<6} {:<24} {} next={}",
            desc.kind_id, desc.tag, shape, next_id
        );
    }
    for (rest, value) in with_prefix(entries, "vom.vkind.") {
        println!("virtual {} {}", rest, value);
    }
    Ok(())
}
