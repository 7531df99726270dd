//! Multi-tab example - tabs run independently, each one action at a time

use nick::{Browser, BrowserConfig, BrowserEvent, NickError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = BrowserConfig::default();
    if let Some(endpoint) = std::env::args().nth(1) {
        config.endpoint = endpoint;
    }
    let browser = Browser::new(config)?;

    let mut events = browser.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let BrowserEvent::NavigationComplete { tab_id, url, http_code } = event {
                println!("[tab {}] {} -> {:?}", tab_id, url, http_code);
            }
        }
    });

    let rust = browser.new_tab().await?;
    let github = browser.new_tab().await?;

    // Different tabs: both navigations are in flight together
    let first = rust.open("https://www.rust-lang.org")?;
    let second = github.open("https://github.com")?;

    // Same tab: a second action is refused, not queued
    match rust.wait_until_present("body", 1000, "and") {
        Err(NickError::ConcurrentAction) => println!("tab {} is busy", rust.id()),
        other => println!("unexpected: {:?}", other.map(|_| ())),
    }

    let (first, second) = tokio::join!(first, second);
    println!("rust-lang.org: {:?}", first?.http_code);
    println!("github.com: {:?}", second?.http_code);

    println!("{}", rust.url()?.await?);
    rust.close()?.await?;

    match rust.open("https://example.com") {
        Err(e) => println!("after close: {}", e),
        Ok(_) => println!("closed tab accepted an action"),
    }

    browser.exit().await?;
    println!("github tab crashed after exit: {}", github.is_crashed());
    Ok(())
}
