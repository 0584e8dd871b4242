fn main() -> anyhow::Result<()> {
    the_small_sync_lib::run()
}
