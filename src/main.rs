use confession_board::app::{self, Command};

fn main() {
    if handle_cli_flags() {
        return;
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        println!("{}", app::USAGE);
        return;
    }

    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("error: {err}\n\n{}", app::USAGE);
            std::process::exit(2);
        }
    };

    if let Err(err) = confession_board::run(command) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("confession-board {}", confession_board::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{}", app::USAGE);
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
