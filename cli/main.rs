#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::process;

use survtmle::bounds::{Bounds, load_bounds};
use survtmle::data::load_observations;
use survtmle::estimate::{Method, estimate};
use survtmle::projection::project;
use survtmle::{IncidenceCurve, RunConfig, TmleFit};

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodCli {
    Hazard,
    Mean,
}

impl From<MethodCli> for Method {
    fn from(method: MethodCli) -> Self {
        match method {
            MethodCli::Hazard => Method::Hazard,
            MethodCli::Mean => Method::Mean,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Observation table with ftime, ftype, trt and covariate columns (.tsv or .csv)
    pub data: String,

    /// TOML run configuration
    #[arg(long, value_name = "PATH")]
    pub config: String,

    /// Bounds table with a t column and l<k>/u<k> pairs per failure type
    #[arg(long, value_name = "PATH")]
    pub bounds: Option<String>,

    /// Override the estimation method of the configuration
    #[arg(long, value_enum)]
    pub method: Option<MethodCli>,

    /// Skip targeting and report G-computation estimates
    #[arg(long)]
    pub gcomp: bool,
}

#[derive(Args)]
pub struct EstimateArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Output path for the estimates
    #[arg(long, default_value = "estimates.tsv")]
    pub out: String,

    /// Optional output path for the covariance matrix of the estimates
    #[arg(long, value_name = "PATH")]
    pub covariance: Option<String>,
}

#[derive(Args)]
pub struct TimepointsArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Comma-separated horizons, each at most the configured horizon
    #[arg(long, value_delimiter = ',', required = true)]
    pub times: Vec<u32>,

    /// Add a non-decreasing (pool-adjacent-violators) version of every curve
    #[arg(long)]
    pub isotonic: bool,

    /// Output path for the curves
    #[arg(long, default_value = "timepoints.tsv")]
    pub out: String,
}

#[derive(Parser)]
#[command(
    name = "survtmle",
    about = "Targeted estimation of cumulative incidence in discrete-time survival data",
    long_about = "Targeted minimum loss-based estimation of treatment-specific cumulative \
                 incidence with competing risks, for discrete-time right-censored data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate cumulative incidence at the configured horizon
    #[command(about = "Estimate cumulative incidence at the horizon (outputs: estimates.tsv)")]
    Estimate(EstimateArgs),

    /// Estimate cumulative incidence curves over several horizons
    #[command(about = "Estimate incidence curves over horizons (outputs: timepoints.tsv)")]
    Timepoints(TimepointsArgs),

    /// Write a run configuration with default models
    #[command(about = "Write a default run configuration")]
    InitConfig {
        /// Destination of the TOML file
        #[arg(value_name = "PATH")]
        path: String,

        #[arg(long, default_value = "6")]
        horizon: u32,

        #[arg(long, value_enum, default_value_t = MethodCli::Hazard)]
        method: MethodCli,
    },

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

#[derive(Serialize)]
struct EstimateRow {
    trt: u8,
    ftype: u8,
    estimate: f64,
    std_error: f64,
    ci_lower: f64,
    ci_upper: f64,
    mean_eic: f64,
    iterations: Option<usize>,
    converged: Option<bool>,
    diagnostics: String,
}

#[derive(Serialize)]
struct CurveRow {
    trt: u8,
    ftype: u8,
    t: u32,
    estimate: f64,
    std_error: f64,
    isotonic: Option<f64>,
}

fn tsv_writer(path: &str) -> Result<csv::Writer<std::fs::File>, csv::Error> {
    csv::WriterBuilder::new().delimiter(b'\t').from_path(path)
}

fn prepare(
    args: &RunArgs,
) -> Result<(survtmle::data::ObservedData, RunConfig, Option<Bounds>), Box<dyn std::error::Error>> {
    println!("Loading observations from: {}", args.data);
    let data = load_observations(&args.data)?;
    println!(
        "Loaded {} subjects with {} covariates",
        data.n(),
        data.covariates.ncols()
    );
    let mut config = RunConfig::load(&args.config)?;
    if let Some(method) = args.method {
        config.method = method.into();
    }
    config.gcomp |= args.gcomp;
    let bounds = args.bounds.as_deref().map(load_bounds).transpose()?;
    Ok((data, config, bounds))
}

fn save_estimates(fit: &TmleFit, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = tsv_writer(path)?;
    for record in &fit.records {
        let diagnostics: Vec<String> = record.diagnostics.iter().map(|d| d.to_string()).collect();
        writer.serialize(EstimateRow {
            trt: record.target.arm,
            ftype: record.target.ftype,
            estimate: record.estimate,
            std_error: record.std_error,
            ci_lower: record.ci_lower,
            ci_upper: record.ci_upper,
            mean_eic: record.mean_eic,
            iterations: record.convergence.map(|c| c.iterations),
            converged: record.convergence.map(|c| c.converged),
            diagnostics: diagnostics.join("; "),
        })?;
    }
    writer.flush()?;
    Ok(())
}

fn save_covariance(fit: &TmleFit, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = tsv_writer(path)?;
    let labels: Vec<String> = fit.records.iter().map(|r| r.target.to_string()).collect();
    let mut header = vec!["target".to_string()];
    header.extend(labels.iter().cloned());
    writer.write_record(&header)?;
    for (label, row) in labels.iter().zip(fit.covariance.rows()) {
        let mut record = vec![label.clone()];
        record.extend(row.iter().map(|v| format!("{v:.10e}")));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn save_curves(curves: &[IncidenceCurve], path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = tsv_writer(path)?;
    for curve in curves {
        for (idx, &t) in curve.horizons.iter().enumerate() {
            writer.serialize(CurveRow {
                trt: curve.target.arm,
                ftype: curve.target.ftype,
                t,
                estimate: curve.estimates[idx],
                std_error: curve.std_errors[idx],
                isotonic: curve.isotonic.as_ref().map(|iso| iso[idx]),
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn run_estimate(args: EstimateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (data, config, bounds) = prepare(&args.run)?;
    let options = config.options(bounds, false);
    let fit = estimate(&data, &config.models, &options)?;
    for record in &fit.records {
        println!(
            "{}: {:.4} [{:.4}, {:.4}]",
            record.target, record.estimate, record.ci_lower, record.ci_upper
        );
        if let Some(convergence) = record.convergence {
            if !convergence.converged {
                println!(
                    "  warning: targeting did not converge after {} iterations",
                    convergence.iterations
                );
            }
        }
    }
    save_estimates(&fit, &args.out)?;
    println!("Estimates saved to: {}", args.out);
    if let Some(path) = args.covariance.as_deref() {
        save_covariance(&fit, path)?;
        println!("Covariance saved to: {path}");
    }
    Ok(())
}

pub fn run_timepoints(args: TimepointsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (data, config, bounds) = prepare(&args.run)?;
    let options = config.options(bounds, true);
    let fit = estimate(&data, &config.models, &options)?;
    let bundle = fit
        .fits
        .as_ref()
        .ok_or("estimation did not return its nuisance fits")?;
    let curves = project(bundle, &args.times, args.isotonic)?;
    save_curves(&curves, &args.out)?;
    println!("Curves for {} target(s) saved to: {}", curves.len(), args.out);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Estimate(args)) => run_estimate(args),
        Some(Commands::Timepoints(args)) => run_timepoints(args),
        Some(Commands::InitConfig {
            path,
            horizon,
            method,
        }) => RunConfig::new(method.into(), horizon)
            .save(&path)
            .map(|()| println!("Configuration written to: {path}"))
            .map_err(Into::into),
        Some(Commands::Version) => {
            println!("survtmle {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
