use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_SERVICE_NAME: &str = "connect-transform";

#[derive(Parser, Debug, Clone)]
#[command(name = "connect-transform")]
#[command(about = "Generate and run BigQuery SQL that turns FlatConnect tables into CleanConnect tables")]
pub struct Args {
    /// GCP project that runs the queries
    #[arg(long, env = "GCP_PROJECT", value_name = "PROJECT")]
    pub project: String,

    /// Where submitted SQL is archived: gs://bucket/prefix or a local directory
    #[arg(long, env = "ARCHIVE_LOCATION", value_name = "LOCATION")]
    pub archive_location: String,

    #[arg(long = "bind", env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: SocketAddr,

    /// YAML naming rule table; the built-in table is used when omitted
    #[arg(long = "rules", env = "NAMING_RULES_PATH", value_name = "FILE")]
    pub rules_path: Option<PathBuf>,

    /// JSON list of false-array concept ID pairs, replacing those in the rule table
    #[arg(long, env = "FALSE_ARRAY_REFERENCE", value_name = "FILE")]
    pub false_array_reference: Option<PathBuf>,

    /// BigQuery location for jobs, e.g. US
    #[arg(long, env = "BQ_LOCATION")]
    pub bq_location: Option<String>,

    #[arg(long, env = "SERVICE_NAME", default_value = DEFAULT_SERVICE_NAME)]
    pub service_name: String,
}
