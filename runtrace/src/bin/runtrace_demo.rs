use std::convert::Infallible;

use runtrace::config::DEFAULT_CONFIG_FILE;
use runtrace::{
    instrument, logging, ArgValue, CallArgs, FnTask, LocalBackend, ParameterDescriptor,
    ParameterKind, RuntraceConfig,
};

fn usage() -> ! {
    eprintln!("Usage: runtrace-demo [conf.ini]");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  runtrace-demo conf.ini");
    std::process::exit(2);
}

fn process_data(args: &CallArgs) -> Result<(), Infallible> {
    let positional: Vec<String> = args.positional.iter().map(ArgValue::to_string).collect();
    println!("args: ({})", positional.join(", "));
    let keyword: Vec<String> = args
        .keyword
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    println!("kwargs: {{{}}}", keyword.join(", "));
    Ok(())
}

fn main() {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();
    let config_path = if args.is_empty() {
        DEFAULT_CONFIG_FILE.to_string()
    } else {
        args.remove(0)
    };
    if !args.is_empty() || config_path.starts_with('-') {
        usage();
    }

    let config = match RuntraceConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = logging::init(config.runtrace.log_format) {
        eprintln!("warning: {e}");
    }

    let task = FnTask::new("process_data", process_data).with_params([
        ParameterDescriptor::new("args", ParameterKind::VarPositional),
        ParameterDescriptor::new("kwargs", ParameterKind::VarKeyword),
    ]);
    let wrapped = instrument(
        config.args.run_spec(),
        LocalBackend::new(&config.runtrace.runs_dir),
    )
    .asset_dir(&config.runtrace.asset_dir)
    .wrap(task);

    let call = CallArgs::positional([1, 2, 3, 4])
        .kwarg("name", "Task")
        .kwarg("type", "Train");
    if let Err(e) = wrapped.invoke(&call) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
