fn main() -> anyhow::Result<()> {
    notecal::cli::run()
}
