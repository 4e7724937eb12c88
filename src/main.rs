fn main() -> std::process::ExitCode {
    wikishell::app::main()
}
