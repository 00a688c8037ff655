fn main() -> anyhow::Result<()> {
    forkserve::cli::run_cli()
}
