//! Basic example following a redirecting URL and watching every hop.
//!
//! This example shows how to:
//! - Create a client with basic configuration
//! - Attach listeners that fire for every redirect hop
//! - Wait for the logical call and inspect its context
//!
//! Run with: `cargo run --example basic_call`

use hopcall::{Client, Error};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter("hopcall=debug,basic_call=info")
        .init();

    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .max_redirects(5)
        .build()?;

    println!("=== Redirecting GET ===");
    let context = client
        .get("http://httpbin.org/redirect/2")?
        .on_response(|response| println!("hop: {} {}", response.status, response.url))
        .on_cookie(|cookie| println!("cookie: {}", cookie))
        .execute()
        .await?;

    let response = context.wait().await?;
    println!("Final URL: {}", response.url);
    println!("Status code: {}", response.status);
    println!("Redirects followed: {}", context.redirect_count());
    println!();

    println!("=== POST with transform ===");
    let length = client
        .post("http://httpbin.org/post")?
        .json(r#"{"title": "My New Post"}"#)
        .execute_with(|response| response.body.len())
        .await?
        .await?;
    println!("Response body was {} bytes", length);

    Ok(())
}
