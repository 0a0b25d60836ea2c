//! EventCloud demo CLI
//!
//! Builds an in-process network, registers one continuous query, publishes
//! every line of an N-Quads file and prints the solutions received.
//!
//! Usage:
//!   eventcloud --peers 8 --input data/sensors.nq \
//!       --query 'SELECT ?g ?v WHERE { GRAPH ?g { ?s <http://ex.org/value> ?v } }' --type binding

use clap::{Parser, ValueEnum};
use eventcloud::api::event_cloud::{EventCloud, Solution, SolutionPayload};
use eventcloud::config::EventCloudConfig;
use eventcloud::core::Quadruple;
use eventcloud::parsing::rdf_parser::parse_nquad_line;
use eventcloud::pubsub::subscription::NotificationType;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Signal,
    Binding,
    CompoundEvent,
}

impl From<Kind> for NotificationType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Signal => NotificationType::Signal,
            Kind::Binding => NotificationType::Binding,
            Kind::CompoundEvent => NotificationType::CompoundEvent,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "eventcloud")]
#[command(about = "EventCloud - publish RDF quadruples and watch a continuous SPARQL query match them")]
struct Args {
    /// Number of peers in the network
    #[arg(short, long, default_value = "4")]
    peers: usize,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Continuous query (SELECT with one GRAPH block)
    #[arg(short, long)]
    query: String,

    /// Notification type
    #[arg(short = 't', long = "type", value_enum, default_value = "binding")]
    kind: Kind,

    /// Input file (N-Quads or N-Triples)
    #[arg(short, long)]
    input: PathBuf,

    /// Graph of the lines that carry none
    #[arg(long, default_value = "http://eventcloud.example.org/default")]
    default_graph: String,

    /// Keep leading timestamps of the input lines instead of publishing now
    #[arg(long)]
    keep_timestamps: bool,

    /// Time to wait for late solutions after the last publication, in ms
    #[arg(long, default_value = "500")]
    linger_ms: u64,
}

fn print_solution(solution: &Solution) {
    match &solution.payload {
        SolutionPayload::Signal => println!("match in {}", solution.meta_graph),
        SolutionPayload::Binding(binding) => {
            let values: Vec<String> = binding.iter().map(|(var, value)| format!("?{} = {}", var, value)).collect();
            println!("{}", values.join(", "));
        }
        SolutionPayload::Quadruples(quadruples) => {
            for quadruple in quadruples {
                println!("{}", quadruple);
            }
            println!();
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EventCloudConfig::from_file(path)?,
        None => EventCloudConfig::default(),
    };

    let cloud = EventCloud::new(config, args.peers)?;
    let handle = cloud.subscribe(&args.query, args.kind.into())?;
    cloud.flush();

    let reader = BufReader::new(File::open(&args.input)?);
    let mut published = 0usize;
    let mut skipped = 0usize;
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_nquad_line(trimmed, &args.default_graph) {
            Ok(quadruple) => {
                let quadruple = if args.keep_timestamps {
                    quadruple
                } else {
                    let [graph, subject, predicate, object] = quadruple.components().map(Clone::clone);
                    Quadruple::new(graph, subject, predicate, object)
                };
                cloud.publish(quadruple)?;
                published += 1;
            }
            Err(e) => {
                tracing::warn!(line = number + 1, error = %e, "line skipped");
                skipped += 1;
            }
        }
    }

    cloud.flush();
    let mut solutions = 0usize;
    while let Some(solution) = handle.receive_timeout(Duration::from_millis(args.linger_ms)) {
        print_solution(&solution);
        solutions += 1;
    }

    println!("\nPublished: {}  Skipped: {}  Solutions: {}", published, skipped, solutions);
    cloud.network().shutdown();
    Ok(())
}
