use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use gwtree::cli::{Cli, Command};
use gwtree::read_write_utils::{read_forest_file, write_forest_file};
use gwtree::utils::{activate_logging, LogOnErrUnwrap};
use gwtree::{CollapsedForest, RankingConfig};

fn main() {
    let args = Cli::parse();
    activate_logging(args.verbose.log_level_filter());

    match args.command {
        Command::Simulate {
            p,
            q,
            n_trees,
            seed,
            output,
        } => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let forest = CollapsedForest::simulate(p, q, n_trees, &mut rng).log_on_err_unwrap();
            let path = write_forest_file(&forest, output, "forest").log_on_err_unwrap();
            info!("wrote simulated forest of {} trees to {:?}", n_trees, path);
        }

        Command::Fit { forest, marginal } => {
            let mut forest = read_forest_file(forest).log_on_err_unwrap();
            let (p, q) = forest.mle(marginal).log_on_err_unwrap();
            println!("params: ({}, {})", p, q);
        }

        Command::Rank {
            forest,
            config,
            output,
            tree_stats,
            summary,
        } => {
            let mut forest = read_forest_file(forest).log_on_err_unwrap();

            let choices = match config {
                Some(path) => RankingConfig::deserialize(path)
                    .log_on_err_unwrap()
                    .parse()
                    .log_on_err_unwrap(),
                None => RankingConfig::default().parse().log_on_err_unwrap(),
            };
            if let Some(isotype_map) = &choices.isotype_map {
                forest
                    .add_isotypes(isotype_map, choices.id_map.as_ref(), &choices.isotype_order)
                    .log_on_err_unwrap();
            }

            let mut summary_writer = summary.map(|arg| arg.create().log_on_err_unwrap());
            let mut stats_writer = tree_stats.map(|arg| arg.create().log_on_err_unwrap());
            let (trimmed, best) = forest
                .filter_trees(
                    &choices.options,
                    summary_writer
                        .as_mut()
                        .map(|w| w as &mut dyn std::io::Write),
                    stats_writer.as_mut().map(|w| w as &mut dyn std::io::Write),
                )
                .log_on_err_unwrap();

            let path = write_forest_file(&trimmed, output, "ranked_forest").log_on_err_unwrap();
            info!("wrote trimmed forest to {:?}", path);
            println!(
                "best tree weights: ll = {:.6}, isotype parsimony = {}, mutability parsimony = {:.6}, alleles = {}",
                best.log_likelihood,
                best.isotype_parsimony,
                best.mutability_parsimony,
                best.alleles
            );
        }
    }
}
