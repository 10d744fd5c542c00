use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use showcase_rstsr_dpd::prelude::*;
use showcase_rstsr_dpd::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct CliParser {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CliArgs {
    #[clap(short, long = "input", help = "Path to the YAML input file")]
    input: PathBuf,

    #[clap(long = "scratch", help = "Scratch directory of the block store")]
    scratch: Option<PathBuf>,

    #[clap(long = "memory", help = "Memory budget for in-core blocks, in MiB")]
    memory: Option<f64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(name = "triples", about = "Three-particle energy correction in the semicanonical basis")]
    Triples(CliArgs),

    #[clap(name = "tpdm", about = "Back-transform the unrestricted MO TPDM to the SO basis")]
    Tpdm(CliArgs),

    #[clap(name = "ci-ints", about = "Build the packed CI integral set")]
    CiInts(CliArgs),

    #[clap(name = "orbitals", about = "Print the orbital spaces of an input file")]
    Orbitals {
        #[clap(short, long = "input", help = "Path to the YAML input file")]
        input: PathBuf,
    },
}

fn read_input(path: &PathBuf) -> Result<CalculationInput> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read input file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("cannot parse input file {}", path.display()))
}

fn load_input(args: &CliArgs) -> Result<CalculationInput> {
    let mut input = read_input(&args.input)?;
    if let Some(scratch) = &args.scratch {
        input.dpd.scratch_dir = scratch.clone();
    }
    if let Some(memory) = args.memory {
        input.dpd.memory_mb = memory;
    }
    Ok(input)
}

fn context(input: &CalculationInput) -> Result<(MOInfo, DpdContext)> {
    let info = input.orbitals.resolve()?;
    info.print_mo();
    let ctx = DpdContext::from_config(info.spaces()?, &input.dpd)?;
    Ok((info, ctx))
}

fn run_triples(input: &CalculationInput) -> Result<()> {
    let Some(triples_input) = &input.triples else {
        bail!("input file has no 'triples' section");
    };
    let (_, ctx) = context(input)?;
    ctx.store().open(units::MO_INTS, OpenMode::Create)?;
    ctx.store().open(units::AMPLITUDES, OpenMode::Create)?;

    let fock_alpha = triples::load_spin_inputs(&ctx, Spin::Alpha, &triples_input.alpha)?;
    let fock_beta = triples::load_spin_inputs(&ctx, Spin::Beta, &triples_input.beta)?;
    let results = triples::compute_three_particle_energy(&ctx, &fock_alpha, &fock_beta)?;

    ctx.store().close(units::MO_INTS, false)?;
    ctx.store().close(units::AMPLITUDES, false)?;
    println!("Three-particle Energy (AAA): {:20.15}", results.e_aaa);
    println!("Three-particle Energy (BBB): {:20.15}", results.e_bbb);
    println!("Three-particle Energy:       {:20.15}", results.e_total);
    Ok(())
}

fn run_tpdm(input: &CalculationInput) -> Result<()> {
    let Some(tpdm_input) = &input.tpdm else {
        bail!("input file has no 'tpdm' section");
    };
    let (_, ctx) = context(input)?;
    ctx.store().open(units::TPDM_PRESORT, OpenMode::Create)?;
    tpdm::load_tpdm_inputs(&ctx, tpdm_input)?;
    tpdm::backtransform_tpdm_unrestricted(&ctx, &input.dpd)?;
    let results = tpdm::so_tpdm_summary(&ctx, tpdm_input.output.as_deref())?;
    println!("SO TPDM squared norm: {:20.15}", results.norm_sq);
    println!("SO TPDM trace:        {:20.15}", results.trace);
    Ok(())
}

fn run_ci_ints(input: &CalculationInput) -> Result<()> {
    let Some(ci_input) = &input.ci else {
        bail!("input file has no 'ci' section");
    };
    let (info, ctx) = context(input)?;
    ctx.store().open(units::CI_INTS, OpenMode::Create)?;
    let summary = ci_ints::build_ci_integrals(&ctx, &info, ci_input)?;
    ctx.store().close(units::CI_INTS, true)?;
    println!("CI orbitals: {}", summary.norb);
    println!("Largest exchange integral: {:.10}", summary.max_k_overall);
    println!("Trace of h': {:20.15}", summary.tf_onel_trace);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliParser::parse();

    let time = std::time::Instant::now();
    match args.command {
        Command::Triples(cli_args) => run_triples(&load_input(&cli_args)?)?,
        Command::Tpdm(cli_args) => run_tpdm(&load_input(&cli_args)?)?,
        Command::CiInts(cli_args) => run_ci_ints(&load_input(&cli_args)?)?,
        Command::Orbitals { input } => {
            let info = read_input(&input)?.orbitals.resolve()?;
            info.print_mo();
            let (n_alpha, n_beta) = info.electrons();
            println!("Electrons (alpha, beta): ({n_alpha}, {n_beta})");
        },
    }
    println!("Elapsed time: {:.2?}", time.elapsed());
    Ok(())
}
