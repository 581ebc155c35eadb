use twinboot_ctrl::errors::error_chain;

pub fn main() {
    if let Err(error) = twinboot_ctrl::cli::main() {
        eprintln!("error: {}", error_chain(&error));
        std::process::exit(1);
    }
}
