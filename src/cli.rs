// cms_importer/src/cli.rs
// Command Line Interface (CLI) specific logic for cms_importer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::catalog;
use crate::entity::EntitySpec;
use crate::error::{ImporterError, Result};
use crate::strapi::StrapiVersion;

/// Imports JSON exports into content-management collections.
#[derive(Parser, Debug,)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// The kind of export file to import.
    #[clap(subcommand)]
    pub command: Commands,

    /// Don't actually modify data. Just pretend.
    #[clap(long, global = true)]
    pub dry_run: bool,

    /// Enable verbose logging
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Number of records processed concurrently (0 for no limit).
    #[clap(short, long, global = true, default_value_t = crate::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Import only a random sample of this many records.
    #[clap(long, global = true)]
    pub sample: Option<usize,>,

    /// Seed for --sample, for a reproducible subset.
    #[clap(long, global = true)]
    pub seed: Option<u64,>,

    /// Target store: http(s)://host for Strapi, sqlite://path, or memory:
    #[clap(long, global = true, env = "IMPORT_STORE_URL", default_value = crate::DEFAULT_STORE_URL)]
    pub store_url: String,

    /// API token sent as a bearer token to Strapi.
    #[clap(long, global = true, env = "STRAPI_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String,>,

    /// Strapi major version of the target instance.
    #[clap(long, global = true, env = "STRAPI_VERSION", value_enum, default_value_t = StrapiVersion::V4)]
    pub strapi_version: StrapiVersion,

    /// Seconds to keep retrying transient store errors (0 disables retries).
    #[clap(long, global = true, default_value_t = 60)]
    pub retry_max_elapsed: u64,

    /// Exit with an error when any record failed.
    #[clap(long, global = true)]
    pub strict: bool,

    /// Write a structured summary report (import_report.json) at the end.
    #[clap(long, global = true)]
    pub report: bool,

    /// Skip the database backup confirmation.
    #[clap(short = 'y', long, global = true)]
    pub yes: bool,
}

#[derive(Subcommand, Debug,)]
pub enum Commands {
    /// Import countries, with their provinces and locations
    Countries(EntityArgs,),
    /// Import provinces, with their locations
    Provinces(EntityArgs,),
    /// Import locations
    Locations(EntityArgs,),
    /// Import room types
    RoomTypes(EntityArgs,),
    /// Import board types
    BoardTypes(EntityArgs,),
    /// Import facilities
    Facilities(EntityArgs,),
    /// Import images
    Images(EntityArgs,),
    /// Import establishments, with their images and facilities
    Establishments(EntityArgs,),
    /// Import any collection from an explicit descriptor
    Custom(CustomArgs,),
}

#[derive(Parser, Debug,)]
pub struct CommonImportArgs {
    /// Field mappings overriding the defaults (e.g., --map Title:name)
    #[clap(long, value_parser = parse_key_val, value_delimiter = ',')]
    pub map: Option<Vec<(String, String,),>,>,
}

#[derive(Parser, Debug,)]
pub struct EntityArgs {
    /// Path to the JSON export
    pub path: PathBuf,

    #[clap(flatten)]
    pub common: CommonImportArgs,
}

#[derive(Parser, Debug,)]
pub struct CustomArgs {
    /// Path to the JSON export
    pub path: PathBuf,

    /// JSON file holding a full entity descriptor
    #[clap(long, conflicts_with_all = ["collection", "natural_key"])]
    pub descriptor: Option<PathBuf,>,

    /// Target collection (e.g., room-types)
    #[clap(long, required_unless_present = "descriptor")]
    pub collection: Option<String,>,

    /// Natural key as SourceField:target_field (e.g., RoomTypeId:room_type_id)
    #[clap(long, value_parser = parse_key_val, required_unless_present = "descriptor")]
    pub natural_key: Option<(String, String,),>,

    #[clap(flatten)]
    pub common: CommonImportArgs,
}

/// Parse a single key-value pair
fn parse_key_val(s: &str,) -> std::result::Result<(String, String,), String,> {
    let pos = s
        .find(':',)
        .ok_or_else(|| format!("invalid KEY:VALUE: no `:` found in `{}`", s),)?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string(),),)
}

fn map_to_hashmap(map_vec: &Option<Vec<(String, String,),>,>,) -> HashMap<String, String,> {
    map_vec
        .as_ref()
        .map(|vec| vec.iter().cloned().collect(),)
        .unwrap_or_default()
}

impl Commands {
    pub fn path(&self,) -> &Path {
        match self {
            Commands::Countries(args,)
            | Commands::Provinces(args,)
            | Commands::Locations(args,)
            | Commands::RoomTypes(args,)
            | Commands::BoardTypes(args,)
            | Commands::Facilities(args,)
            | Commands::Images(args,)
            | Commands::Establishments(args,) => &args.path,
            Commands::Custom(args,) => &args.path,
        }
    }

    /// The descriptor this subcommand imports with, `--map` overrides applied.
    pub async fn entity_spec(&self,) -> Result<EntitySpec,> {
        let (spec, common,) = match self {
            Commands::Countries(args,) => (catalog::countries(), &args.common,),
            Commands::Provinces(args,) => (catalog::provinces(), &args.common,),
            Commands::Locations(args,) => (catalog::locations(), &args.common,),
            Commands::RoomTypes(args,) => (catalog::room_types(), &args.common,),
            Commands::BoardTypes(args,) => (catalog::board_types(), &args.common,),
            Commands::Facilities(args,) => (catalog::facilities(), &args.common,),
            Commands::Images(args,) => (catalog::images(), &args.common,),
            Commands::Establishments(args,) => (catalog::establishments(), &args.common,),
            Commands::Custom(args,) => (args.custom_spec().await?, &args.common,),
        };
        Ok(spec.with_mappings(&map_to_hashmap(&common.map,),),)
    }
}

impl CustomArgs {
    async fn custom_spec(&self,) -> Result<EntitySpec,> {
        if let Some(path,) = &self.descriptor {
            let raw = tokio::fs::read(path,)
                .await
                .map_err(|source| ImporterError::IoError {
                    path: path.clone(),
                    source,
                },)?;
            return serde_json::from_slice(&raw,).map_err(|e| ImporterError::ConfigurationError(
                format!("Invalid descriptor {}: {}", path.display(), e),
            ),);
        }

        match (&self.collection, &self.natural_key,) {
            (Some(collection,), Some((key_source, key_target,),),) => {
                Ok(EntitySpec::new(collection, collection, key_source, key_target,),)
            },
            _ => Err(ImporterError::ConfigurationError(
                "custom imports need --descriptor or both --collection and --natural-key"
                    .to_string(),
            ),),
        }
    }
}

/// Interprets the answer to the backup prompt. Only an explicit yes proceeds.
pub fn backup_confirmed(answer: &str,) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
