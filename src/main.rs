use std::path::PathBuf;
use clap::Parser;
use digit_export::prompt::{FixedAnswer, LineConfirmation};
use digit_export::{run, ExportConfig, DEFAULT_FULL_MODEL_PATH, DEFAULT_OPSET_VERSION, DEFAULT_OUTPUT_PATH, DEFAULT_STATE_DICT_PATH};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Pickled model saved with `torch.save(model, ...)`
    #[clap(long, default_value = DEFAULT_FULL_MODEL_PATH)]
    full_model: PathBuf,

    /// Weights saved with `torch.save(model.state_dict(), ...)`
    #[clap(long, default_value = DEFAULT_STATE_DICT_PATH)]
    state_dict: PathBuf,

    #[clap(long, short, default_value = DEFAULT_OUTPUT_PATH)]
    output: PathBuf,

    #[clap(long, default_value_t = DEFAULT_OPSET_VERSION)]
    opset: i64,

    /// Seed for random weights when no checkpoint is found
    #[clap(long)]
    seed: Option<u64>,

    #[clap(long)]
    no_constant_folding: bool,

    /// Store parameters in a `.data` file next to the model
    #[clap(long)]
    external_data: bool,

    /// Continue with random weights without asking
    #[clap(long, short)]
    yes: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = ExportConfig {
        full_model_path: args.full_model,
        state_dict_path: args.state_dict,
        output_path: args.output,
        opset_version: args.opset,
        seed: args.seed,
        fold_constants: !args.no_constant_folding,
        external_data: args.external_data,
    };

    let outcome = if args.yes {
        run(&config, &mut FixedAnswer::yes())?
    } else {
        run(&config, &mut LineConfirmation::stdin())?
    };
    let code = outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
