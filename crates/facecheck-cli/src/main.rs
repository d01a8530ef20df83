use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facecheck_core::types::{PersonId, RecordId};
use facecheck_core::{CaptureContext, Config, RecognitionError, RecognitionService, SqliteStore};

#[derive(Parser)]
#[command(name = "facecheck", about = "Face check-in administration and local recognition")]
struct Cli {
    /// Print listings and reports as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage enrolled people
    Person {
        #[command(subcommand)]
        action: PersonCommand,
    },
    /// Add a face record for a person and generate its encoding
    Enroll {
        /// Person the images belong to
        #[arg(short, long)]
        person: PersonId,
        /// One to three face images
        #[arg(required = true, num_args = 1..=3)]
        images: Vec<PathBuf>,
    },
    /// Regenerate stored encodings
    Regenerate {
        /// Only records that have no encoding yet
        #[arg(long, conflicts_with = "record")]
        missing_only: bool,
        /// Specific record ids (repeatable)
        #[arg(long)]
        record: Vec<RecordId>,
    },
    /// Identify the person in an image and record attendance
    Recognize {
        image: PathBuf,
        #[arg(long)]
        service_id: Option<i64>,
    },
    /// Show detected face regions and whether each passes validation
    Inspect { image: PathBuf },
    /// Manage face records
    Record {
        #[command(subcommand)]
        action: RecordCommand,
    },
    /// List attendance entries
    Attendance {
        #[arg(long)]
        person: Option<PersonId>,
    },
}

#[derive(Subcommand)]
enum RecordCommand {
    /// List face records
    List,
    /// Replace a record's images and regenerate its encoding
    Replace {
        id: RecordId,
        /// One to three face images
        #[arg(required = true, num_args = 1..=3)]
        images: Vec<PathBuf>,
    },
    /// Remove a face record; attendance rows keep the person
    Remove { id: RecordId },
}

#[derive(Subcommand)]
enum PersonCommand {
    /// Add a person
    Add { name: String },
    /// List people
    List,
    /// Remove a person with their face records and attendance
    Remove { id: PersonId },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("cannot open {}", config.db_path.display()))?,
    );
    tracing::debug!(db = %config.db_path.display(), "store opened");

    match cli.command {
        Commands::Person { action } => person(&store, action, cli.json)?,
        Commands::Record { action } => record(&config, &store, action, cli.json).await?,
        Commands::Attendance { person } => {
            let events = store.list_attendance(person)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&events)?);
                return Ok(());
            }
            for event in events {
                println!(
                    "{}  person {:>4}  service {:<6}  {}  confidence {}",
                    event.checked_in_at.to_rfc3339(),
                    event.person_id,
                    event.service_id.map_or("-".to_string(), |s| s.to_string()),
                    event.capture_method.as_str(),
                    event.confidence.map_or("-".to_string(), |c| format!("{c:.3}")),
                );
            }
        }
        Commands::Enroll { person, images } => {
            let images = read_images(&images)?;
            let record = store.add_record(person, &images)?;
            let service = RecognitionService::with_sqlite(&config, Arc::clone(&store))?;
            match service.enroll(record).await {
                Ok(_) => println!("Enrolled record {record} for person {person}"),
                Err(RecognitionError::NoFaceDetected) => {
                    println!("Record {record} saved, but no usable face was found; add better images and run `facecheck regenerate --record {record}`");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Regenerate { missing_only, record } => {
            let ids = if missing_only {
                None
            } else if record.is_empty() {
                Some(store.list_records()?.into_iter().map(|r| r.id).collect())
            } else {
                Some(record)
            };
            let service = RecognitionService::with_sqlite(&config, Arc::clone(&store))?;
            let report = service.regenerate(ids).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&report)?);
                return Ok(());
            }
            println!(
                "Regenerated {} of {} encodings ({} failed)",
                report.success, report.total, report.failed
            );
        }
        Commands::Recognize { image, service_id } => {
            let bytes = std::fs::read(&image).with_context(|| format!("cannot read {}", image.display()))?;
            let service = RecognitionService::with_sqlite(&config, Arc::clone(&store))?;
            match service.recognize_one(bytes, CaptureContext { service_id }).await {
                Ok(m) => println!(
                    "Matched {} (person {}, record {}) distance {:.4} confidence {:.3}",
                    m.display_name, m.person_id, m.record_id, m.distance, m.confidence
                ),
                Err(RecognitionError::NoConfidentMatch { best_distance }) => match best_distance {
                    Some(d) => println!("No confident match (nearest distance {d:.4})"),
                    None => println!("No confident match"),
                },
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Inspect { image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("cannot read {}", image.display()))?;
            let service = RecognitionService::with_sqlite(&config, Arc::clone(&store))?;
            let verdicts = service.inspect(bytes).await?;
            if verdicts.is_empty() {
                println!("No candidate regions (strategy: {})", service.strategy());
            }
            for (i, v) in verdicts.iter().enumerate() {
                let r = &v.region;
                let outcome = match &v.rejection {
                    None => "accepted".to_string(),
                    Some(reason) => format!("rejected: {reason}"),
                };
                println!(
                    "#{i}  x {:.0} y {:.0}  {:.0}x{:.0}  score {:.3}  {outcome}",
                    r.x, r.y, r.width, r.height, r.confidence
                );
            }
        }
    }

    Ok(())
}

fn person(store: &SqliteStore, action: PersonCommand, json: bool) -> Result<()> {
    match action {
        PersonCommand::Add { name } => {
            if name.trim().is_empty() {
                bail!("name must not be empty");
            }
            let id = store.add_person(&name)?;
            println!("Added person {id}: {}", name.trim());
        }
        PersonCommand::List => {
            let people = store.list_people()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&people)?);
                return Ok(());
            }
            if people.is_empty() {
                println!("No people enrolled");
            }
            for p in people {
                println!("{:>4}  {}  (added {})", p.id, p.name, p.created_at);
            }
        }
        PersonCommand::Remove { id } => {
            if store.remove_person(id)? {
                println!("Removed person {id}");
            } else {
                bail!("person {id} not found");
            }
        }
    }
    Ok(())
}

async fn record(config: &Config, store: &Arc<SqliteStore>, action: RecordCommand, json: bool) -> Result<()> {
    match action {
        RecordCommand::List => {
            let records = store.list_records()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("No face records");
            }
            for r in records {
                println!(
                    "record {:>4}  person {:>4}  images {}  encoding {}  updated {}",
                    r.id,
                    r.person_id,
                    r.image_count,
                    if r.has_encoding { "yes" } else { "no" },
                    r.updated_at
                );
            }
        }
        RecordCommand::Replace { id, images } => {
            let images = read_images(&images)?;
            store.replace_images(id, &images)?;
            let service = RecognitionService::with_sqlite(config, Arc::clone(store))?;
            match service.enroll(id).await {
                Ok(_) => println!("Replaced images of record {id} and regenerated its encoding"),
                Err(RecognitionError::NoFaceDetected) => {
                    println!("Images of record {id} replaced, but no usable face was found; the record has no encoding");
                }
                Err(e) => return Err(e.into()),
            }
        }
        RecordCommand::Remove { id } => {
            if store.remove_record(id)? {
                println!("Removed record {id}");
            } else {
                bail!("record {id} not found");
            }
        }
    }
    Ok(())
}

fn read_images(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths
        .iter()
        .map(|p| std::fs::read(p).with_context(|| format!("cannot read {}", p.display())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_enroll_accepts_at_most_three_images() {
        assert!(Cli::try_parse_from(["facecheck", "enroll", "--person", "1", "a.jpg", "b.jpg", "c.jpg"]).is_ok());
        assert!(Cli::try_parse_from(["facecheck", "enroll", "--person", "1", "a", "b", "c", "d"]).is_err());
        assert!(Cli::try_parse_from(["facecheck", "enroll", "--person", "1"]).is_err());
    }

    #[test]
    fn test_record_replace_arguments() {
        let cli = Cli::try_parse_from(["facecheck", "record", "replace", "7", "a.jpg", "b.jpg"]).unwrap();
        match cli.command {
            Commands::Record {
                action: RecordCommand::Replace { id, images },
            } => {
                assert_eq!(id, 7);
                assert_eq!(images.len(), 2);
            }
            _ => panic!("wrong subcommand"),
        }
        assert!(Cli::try_parse_from(["facecheck", "record", "replace", "7"]).is_err());
        assert!(Cli::try_parse_from(["facecheck", "record", "replace", "7", "a", "b", "c", "d"]).is_err());
    }

    #[test]
    fn test_regenerate_flags_conflict() {
        assert!(Cli::try_parse_from(["facecheck", "regenerate", "--missing-only", "--record", "3"]).is_err());
        let cli = Cli::try_parse_from(["facecheck", "regenerate", "--record", "3", "--record", "5"]).unwrap();
        match cli.command {
            Commands::Regenerate { record, missing_only } => {
                assert_eq!(record, vec![3, 5]);
                assert!(!missing_only);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
