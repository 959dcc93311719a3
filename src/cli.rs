//! Command Line Interface.
//!
//! The binary operates on bincode-serialized forests; producing those from
//! PHYLIP/dnapars output is the job of external tooling. Three subcommands
//! are offered: `simulate` writes a simulated forest, `fit` runs the MLE on a
//! stored forest, and `rank` trims a stored forest under the ranking
//! criteria, writing the reports next to `outbase`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use patharg::OutputArg;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Simulate a forest of collapsed trees and serialize it.
    Simulate {
        /// Branching probability.
        #[arg(short, long)]
        p: f64,

        /// Mutation probability.
        #[arg(short, long)]
        q: f64,

        /// Number of trees to simulate.
        #[arg(short, long, default_value_t = 1)]
        n_trees: usize,

        /// RNG seed; random when omitted.
        #[arg(long)]
        seed: Option<u64>,

        /// Output file, or a directory for a timestamped default name.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Fit branching-process parameters to a stored forest.
    Fit {
        /// Bincode-serialized forest file.
        #[arg(short, long)]
        forest: PathBuf,

        /// Maximize the marginal likelihood over trees instead of the joint.
        #[arg(long)]
        marginal: bool,
    },

    /// Rank the forest's trees and trim to the optimal set.
    Rank {
        /// Bincode-serialized forest file.
        #[arg(short, long)]
        forest: PathBuf,

        /// TOML ranking config (see the config module docs for the format).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to write the trimmed forest.
        #[arg(short, long)]
        output: PathBuf,

        /// Per-tree stats table destination ('-' for stdout).
        #[arg(long)]
        tree_stats: Option<OutputArg>,

        /// Forest summary destination ('-' for stdout).
        #[arg(long)]
        summary: Option<OutputArg>,
    },
}
