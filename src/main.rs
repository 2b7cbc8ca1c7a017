mod cli;

fn main() -> anyhow::Result<()> {
    gesturectl::logging::init();
    cli::run()
}
