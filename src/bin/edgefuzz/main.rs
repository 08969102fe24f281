mod cli;

use clap::Parser;

use edgefuzz::fuzzer::Fuzzer;

fn main() {
    env_logger::init();

    let cli = cli::Cli::parse();
    if let Err(err) = run(&cli) {
        log::error!("{err}");
        eprintln!("edgefuzz: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &cli::Cli) -> edgefuzz::Result<()> {
    let mut fuzzer = Fuzzer::new(
        &cli.target_id,
        &cli.target,
        &cli.args,
        &cli.seeds,
        &cli.output,
        cli.fuzz_config(),
    )?;

    if let Some(dir) = &cli.checkpoint_path {
        fuzzer.set_checkpoint_dir(dir);
    }
    if let Some(checkpoint) = &cli.resume_from {
        fuzzer.resume_from(checkpoint)?;
    }

    fuzzer.run(cli.duration)
}
