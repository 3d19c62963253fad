// tradestore/src/cli.rs

use tradestore_core::query;

/// What the user asked the binary to do.
#[derive(Debug)]
pub enum Command {
    Ingest { input: std::path::PathBuf },
    Serve,
    Query { request: query::SearchRequest },
}

/// Structure representing command-line arguments.
#[derive(Debug)]
pub struct Args {
    pub config: Option<std::path::PathBuf>,
    pub command: Command,
}

impl Args {
    /// Parses command-line arguments using `clap`.
    ///
    /// # Returns
    /// * `Args` - Struct containing the chosen command and optional config path.
    ///
    /// # Errors
    /// * Exits through clap on missing or invalid arguments, or when `query`
    ///   is given more than two predicates.
    pub fn parse() -> Self {
        let config_arg = clap::Arg::new("config")
            .short('c')
            .long("config")
            .help("Path to the settings.json configuration file")
            .global(true)
            .num_args(1);

        let mut command = clap::Command::new("tradestore")
            .version("0.1.0")
            .about("Fixed-width trade event store")
            .subcommand_required(true)
            .arg(config_arg)
            .subcommand(
                clap::Command::new("ingest")
                    .about("Build the record store and indexes from a CSV file")
                    .arg(
                        clap::Arg::new("input")
                            .help("Path to the input CSV file")
                            .required(true)
                            .num_args(1),
                    ),
            )
            .subcommand(
                clap::Command::new("serve")
                    .about("Serve search requests over the request pipe until signaled"),
            )
            .subcommand(
                clap::Command::new("query")
                    .about("Send one search request to a running server")
                    .arg(u32_arg("slot", "Match records in this slot"))
                    .arg(u32_arg("tx-idx", "Match records at this transaction index"))
                    .arg(text_arg("direction", "Match records with this direction (e.g. buy, sell)"))
                    .arg(text_arg("wallet", "Match records signed by this wallet"))
                    .arg(u32_arg("row", "Return only this 1-based row")),
            );

        let matches = command.get_matches_mut();
        let config = matches.get_one::<String>("config").map(std::path::PathBuf::from);

        let command = match matches.subcommand() {
            Some(("ingest", sub)) => Command::Ingest {
                input: sub
                    .get_one::<String>("input")
                    .map(std::path::PathBuf::from)
                    .unwrap_or_default(),
            },
            Some(("query", sub)) => {
                let mut predicates = Vec::new();
                if let Some(&slot) = sub.get_one::<u32>("slot") {
                    predicates.push(query::Predicate::Slot(slot));
                }
                if let Some(&tx_idx) = sub.get_one::<u32>("tx-idx") {
                    predicates.push(query::Predicate::TxIdx(tx_idx));
                }
                if let Some(direction) = sub.get_one::<String>("direction") {
                    predicates.push(query::Predicate::Direction(direction.clone()));
                }
                if let Some(wallet) = sub.get_one::<String>("wallet") {
                    predicates.push(query::Predicate::Wallet(wallet.clone()));
                }
                if let Some(&row) = sub.get_one::<u32>("row") {
                    predicates.push(query::Predicate::Row(row));
                }
                if predicates.len() > 2 {
                    command
                        .error(
                            clap::error::ErrorKind::ArgumentConflict,
                            "a request carries at most two predicates",
                        )
                        .exit();
                }

                let mut predicates = predicates.into_iter();
                Command::Query {
                    request: query::SearchRequest::new(
                        predicates.next().unwrap_or_default(),
                        predicates.next().unwrap_or_default(),
                    ),
                }
            }
            _ => Command::Serve,
        };

        Args { config, command }
    }
}

fn u32_arg(name: &'static str, help: &'static str) -> clap::Arg {
    clap::Arg::new(name)
        .long(name)
        .help(help)
        .num_args(1)
        .value_parser(clap::value_parser!(u32))
}

fn text_arg(name: &'static str, help: &'static str) -> clap::Arg {
    clap::Arg::new(name)
        .long(name)
        .help(help)
        .num_args(1)
}
