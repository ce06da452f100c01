mod bus;
mod control;
mod dispatch;
mod drivers;
mod host;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
