use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::Parser;

use rdsim::model::ModelDesc;
use rdsim::state::SimState;
use rdsim::system::EvolveBounds;

#[derive(Parser)]
#[clap(version, about = "Particle-based stochastic reaction-diffusion simulator")]
struct Opts {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Run a model description from scratch.
    Run(RunOpts),
    /// Resume a checkpointed run.
    Resume(ResumeOpts),
}

#[derive(Parser)]
struct RunOpts {
    /// Model description file (YAML, or JSON with a .json extension).
    input: String,
    /// Simulated time to run for.
    #[arg(short, long)]
    time: Option<f64>,
    /// Event count to run for.
    #[arg(short, long)]
    events: Option<u64>,
    /// Override the model's seed.
    #[arg(short, long)]
    seed: Option<u64>,
    /// Directory for count output files.
    #[arg(short, long, default_value = "output")]
    output: PathBuf,
}

#[derive(Parser)]
struct ResumeOpts {
    /// Checkpoint file written by a previous run.
    checkpoint: String,
    /// Additional simulated time to run for.
    #[arg(short, long)]
    time: Option<f64>,
    /// Additional event count to run for.
    #[arg(short, long)]
    events: Option<u64>,
    /// Directory for count output files.
    #[arg(short, long, default_value = "output")]
    output: PathBuf,
}

fn bounds_from(time: Option<f64>, events: Option<u64>) -> anyhow::Result<EvolveBounds> {
    let bounds = EvolveBounds {
        for_time: time,
        for_events: events,
        ..Default::default()
    };
    if !bounds.is_strongly_bounded() {
        bail!("give at least one of --time and --events");
    }
    Ok(bounds)
}

fn write_counts(state: &SimState, outdir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(outdir)?;
    for buf in &state.buffers {
        let path = outdir.join(format!("{}.gdat", buf.spec.name));
        let mut w = BufWriter::new(File::create(&path)?);
        buf.write_gdat(&mut w)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    match opts.subcmd {
        SubCommand::Run(po) => {
            let mut system = ModelDesc::from_file(&po.input)?.to_system()?;
            if let Some(seed) = po.seed {
                system.seed = seed;
            }
            let mut state = system.new_state();
            let outcome = system.evolve(&mut state, bounds_from(po.time, po.events)?)?;
            println!(
                "{outcome:?}: t = {:.6e}, {} events, {} molecules",
                state.time(),
                state.total_events(),
                state.n_mols()
            );
            write_counts(&state, &po.output)?;
        }
        SubCommand::Resume(po) => {
            let (system, mut state) = rdsim::checkpoint::load(Path::new(&po.checkpoint))?;
            println!(
                "resuming at t = {:.6e}, {} events, {} molecules",
                state.time(),
                state.total_events(),
                state.n_mols()
            );
            let outcome = system.evolve(&mut state, bounds_from(po.time, po.events)?)?;
            println!(
                "{outcome:?}: t = {:.6e}, {} events, {} molecules",
                state.time(),
                state.total_events(),
                state.n_mols()
            );
            write_counts(&state, &po.output)?;
        }
    }
    Ok(())
}
