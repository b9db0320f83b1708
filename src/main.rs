use cinder::{CinderError, Vm};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: cinder <script>");
        std::process::exit(64);
    }

    let source = match std::fs::read_to_string(&args[1]) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("could not read {}: {}", args[1], err);
            std::process::exit(74);
        }
    };

    let mut vm = Vm::new();
    let mut stdout = std::io::stdout();
    match vm.interpret(&source, &mut stdout) {
        Ok(()) => {}
        Err(err @ CinderError::Compile(_)) => {
            eprintln!("{}", err);
            std::process::exit(65);
        }
        Err(err @ CinderError::Runtime(_)) => {
            eprintln!("{}", err);
            std::process::exit(70);
        }
    }
}
