#[tokio::main]
async fn main() {
    if let Err(error) = seismo_stream_lib::run().await {
        tracing::error!(%error, "seismo-stream exited with an error");
        eprintln!("seismo-stream: {error}");
        std::process::exit(1);
    }
}
