use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use pyhook::{CallDescriptor, Error, NativeValue, RuntimeHandle};

/// pyhook - call Python functions from the command line
#[derive(Parser, Debug)]
#[command(name = "pyhook")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to put on sys.path (repeatable; later ones take priority)
    #[arg(long = "path", value_name = "DIR")]
    paths: Vec<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call MODULE.FUNCTION with JSON arguments and print the JSON result
    Call {
        module: String,
        function: String,
        /// Positional arguments, one JSON value each
        args: Vec<String>,
    },
    /// Check whether MODULE can be imported
    Import { module: String },
    /// Print sys.path
    Paths,
}

fn run(args: Args) -> Result<(), Error> {
    let runtime = RuntimeHandle::new();
    for path in &args.paths {
        runtime.add_search_path(path)?;
    }

    match args.command {
        Command::Call {
            module,
            function,
            args,
        } => {
            let values = args
                .iter()
                .map(|arg| {
                    serde_json::from_str::<NativeValue>(arg).map_err(|e| {
                        Error::InvalidInput(format!("argument {arg:?} is not JSON: {e}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let call = CallDescriptor::new(module, function).args(values);
            let result = runtime.call(&call)?;
            let json =
                serde_json::to_string_pretty(&result).map_err(|e| Error::ResultConversion {
                    site: call.site(),
                    detail: e.to_string(),
                })?;
            println!("{json}");
        }
        Command::Import { module } => {
            runtime.import_module(&module)?;
            println!("{module}: ok");
        }
        Command::Paths => {
            for path in runtime.search_paths()? {
                println!("{path}");
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
