use std::fmt;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::forest::ForestParams;
use crate::pipeline::PipelineConfig;
use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stroke risk prediction service", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Verbose level")]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fit the transform and classifier and write the model artifact
    Train(TrainArgs),
    /// Serve predictions over HTTP
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(short, long, default_value = "data/healthcare-dataset-stroke-data.csv", help = "Input dataset (csv or parquet)")]
    pub dataset: PathBuf,
    #[arg(short, long, default_value = ".", help = "Directory for the artifact, metrics and golden fixture")]
    pub output_dir: PathBuf,
    #[arg(long, default_value_t = 100)]
    pub trees: usize,
    #[arg(long, default_value_t = 10)]
    pub max_depth: u16,
    #[arg(long, default_value_t = 5)]
    pub min_samples_split: usize,
    #[arg(long, default_value_t = 2)]
    pub min_samples_leaf: usize,
    #[arg(long, help = "Columns per tree, square root of the feature count by default")]
    pub max_features: Option<usize>,
    #[arg(long, default_value_t = 0.2)]
    pub test_size: f64,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long, help = "Train on the imbalanced split as is")]
    pub no_balance: bool,
    #[arg(long, help = "Write the transformed training table to this CSV file")]
    pub export_features: Option<PathBuf>,
}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "API_PORT", default_value_t = 8000)]
    pub port: u16,
    #[arg(long, env = "MODEL_ARTIFACT", default_value = "stroke_model.json")]
    pub artifact: PathBuf,
    #[arg(long, env = "secret_key", hide_env_values = true)]
    pub jwt_secret: Option<String>,
    #[arg(long, env = "CORS_ORIGIN", help = "Allowed browser origin, any origin by default")]
    pub cors_origin: Option<String>,
}

impl fmt::Debug for ServeArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeArgs")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("artifact", &self.artifact)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("cors_origin", &self.cors_origin)
            .finish()
    }
}

impl From<TrainArgs> for PipelineConfig {
    fn from(args: TrainArgs) -> Self {
        let mut config = PipelineConfig::new(args.dataset, args.output_dir);
        config.forest = ForestParams {
            n_trees: args.trees,
            max_depth: args.max_depth,
            min_samples_split: args.min_samples_split,
            min_samples_leaf: args.min_samples_leaf,
            max_features: args.max_features,
            seed: args.seed,
        };
        config.test_size = args.test_size;
        config.seed = args.seed;
        config.balance = !args.no_balance;
        config.export_features = args.export_features;
        config
    }
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            artifact: args.artifact,
            jwt_secret: args.jwt_secret,
            cors_origin: args.cors_origin,
        }
    }
}
