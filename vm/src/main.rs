use clap::Parser as ClapParser;
use std::{process, sync::Arc};

use heap::HeapSettings;
use object::Value;

use vm::{Config, VirtualMachine, demos};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Demo function to run
    #[arg(default_value = "main", help = "add, fib, sum_to, point or main")]
    function: String,

    /// Integer arguments passed to the function
    #[arg(allow_negative_numbers = true)]
    args: Vec<i64>,

    /// Call native entries where one is registered
    #[arg(long)]
    jit: bool,

    /// Pass only the context to native entries
    #[arg(long, help = "Native entries read their arguments from the stack")]
    stack_only: bool,

    #[arg(short, long, help = "Log calls, jit transitions and collections")]
    verbose: bool,

    #[arg(long, default_value_t = Config::default().stack_size)]
    stack_size: usize,

    #[arg(long, default_value_t = HeapSettings::default().collect_threshold)]
    collect_threshold: usize,

    /// Print every loaded function instead of running
    #[arg(long)]
    disassemble: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = Config {
        jit: cli.jit,
        pass_param: !cli.stack_only,
        verbose: cli.verbose,
        stack_size: cli.stack_size,
    };
    let settings = HeapSettings {
        collect_threshold: cli.collect_threshold,
        ..HeapSettings::default()
    };

    let mut vm = VirtualMachine::with_heap_settings(config, settings);
    if let Err(err) = demos::install(&mut vm) {
        eprintln!("Error building demos: {err}");
        process::exit(1);
    }
    if cli.jit {
        if let Err(err) = demos::install_native(&mut vm) {
            eprintln!("Error installing native entries: {err}");
            process::exit(1);
        }
    }

    if cli.disassemble {
        for index in 0..vm.function_count() {
            if let Ok(function) = vm.get_function(index) {
                println!("#{index} {}", function.disassemble());
            }
        }
        return;
    }

    let vm = Arc::new(vm);
    let args: Vec<Value> = cli.args.iter().map(|&n| Value::from_int48(n)).collect();
    match vm.run(&cli.function, &args) {
        Ok(result) => println!("=> {result}"),
        Err(err) => {
            eprintln!("Error running {}: {err}", cli.function);
            process::exit(1);
        }
    }
    log::info!("heap: {:?}", vm.heap().stats());
}
