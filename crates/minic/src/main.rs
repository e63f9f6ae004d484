use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use minic_vm::compiler::{Compiler, ListingSink};
use minic_vm::instruction::{Op, disassemble};
use minic_vm::vm::{TraceSink, Vm};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Print each source line with the code compiled for it, then exit.
    #[arg(short = 's', long)]
    listing: bool,
    /// Print each executed instruction.
    #[arg(short = 'd', long)]
    trace: bool,
    /// Source file to compile and run.
    file: PathBuf,
    /// Arguments passed through to the program.
    args: Vec<String>,
}

struct StdoutListing;

impl ListingSink for StdoutListing {
    fn line(&mut self, number: u32, text: &str, code: &[i64]) {
        println!("{number}: {text}");
        print!("{}", disassemble(code));
    }
}

struct StdoutTrace;

impl TraceSink for StdoutTrace {
    fn instruction(&mut self, cycle: u64, op: Op, operand: Option<i64>) {
        match operand {
            Some(value) => println!("{cycle}> {op} {value}"),
            None => println!("{cycle}> {op}"),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let source = match std::fs::read_to_string(&args.file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{}: {err}", args.file.display());
            return ExitCode::FAILURE;
        }
    };
    let mut listing = StdoutListing;
    let mut compiler = Compiler::new(&source);
    if args.listing {
        compiler = compiler.with_listing(&mut listing);
    }
    let program = match compiler.compile() {
        Ok(program) => program,
        Err(err) => {
            eprintln!("compile error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if args.listing {
        return ExitCode::SUCCESS;
    }
    let name = args.file.display().to_string();
    let mut run_args: Vec<&str> = vec![name.as_str()];
    run_args.extend(args.args.iter().map(String::as_str));
    let mut vm = Vm::new(&program);
    let result = if args.trace {
        vm.run_traced(&run_args, &mut StdoutTrace)
    } else {
        vm.run(&run_args)
    };
    match result {
        Ok(status) => ExitCode::from(status as u8),
        Err(err) => {
            eprintln!("runtime error: {err}");
            ExitCode::FAILURE
        }
    }
}
