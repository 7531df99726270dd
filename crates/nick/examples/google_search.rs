//! Search example - open a page, wait for a form, inject a helper, scrape
//!
//! Needs Chrome listening on the configured endpoint:
//! `chrome --remote-debugging-port=9222`, then pass the browser WebSocket
//! URL as the first argument.

use nick::{Browser, BrowserConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = BrowserConfig::default();
    if let Some(endpoint) = std::env::args().nth(1) {
        config.endpoint = endpoint;
    }
    config.blacklist = vec!["doubleclick.net".to_string()];

    let browser = Browser::new(config)?;
    let tab = browser.new_tab().await?;

    let outcome = tab.open("https://www.google.com")?.await?;
    println!("Opened {:?} (HTTP {:?})", outcome.url, outcome.http_code);

    tab.wait_until_visible("form[action='/search']", 5000, "and")?
        .await?;
    tab.inject("https://code.jquery.com/jquery-3.7.1.min.js")?
        .await?;

    tab.evaluate(
        "function (query) { $('textarea[name=q], input[name=q]').val(query).closest('form').submit(); }",
        "rust async browser automation",
    )?
    .await?;

    let matched = tab
        .wait_until_visible(["#search", "#captcha-form"], 10_000, "or")?
        .await?;
    if matched.as_deref() == Some("#captcha-form") {
        println!("Google asked for a captcha, stopping here");
    } else {
        let titles = tab
            .evaluate(
                "function () { return $('#search h3').map(function () { return $(this).text(); }).get(); }",
                (),
            )?
            .await?;
        println!("Results: {}", serde_json::to_string_pretty(&titles)?);
    }

    tab.close()?.await?;
    browser.exit().await?;
    Ok(())
}
