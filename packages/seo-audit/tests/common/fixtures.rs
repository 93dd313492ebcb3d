//! Scripted sites for pipeline tests.

use seo_audit::testing::MockFetcher;

pub const ROOT: &str = "https://example.com/";

/// Root links to /a and /b; /a links on to /c.
pub fn three_page_site() -> MockFetcher {
    MockFetcher::new()
        .with_page(
            ROOT,
            r#"<html><head><title>Home</title></head>
               <body><h1>Home</h1><a href="/a">A</a><a href="/b">B</a></body></html>"#,
        )
        .with_page(
            "https://example.com/a",
            r#"<html><head><title>A</title></head>
               <body><h1>A</h1><a href="/c">C</a></body></html>"#,
        )
        .with_page(
            "https://example.com/b",
            "<html><head><title>B</title></head><body><h1>B</h1></body></html>",
        )
        .with_page(
            "https://example.com/c",
            "<html><head><title>C</title></head><body><h1>C</h1></body></html>",
        )
}

/// A well-formed root page with one broken internal link.
pub fn shop_site() -> MockFetcher {
    MockFetcher::new()
        .with_page(
            ROOT,
            r#"<html><head>
                 <title>Handmade Shoes</title>
                 <meta name="description" content="Shoes made by hand in Minneapolis">
               </head><body>
                 <h1>Handmade Shoes</h1>
                 <h2>Boots</h2>
                 <img src="/boot.png" alt="A leather boot">
                 <a href="/about">About</a>
                 <a href="/missing">Old page</a>
               </body></html>"#,
        )
        .with_page(
            "https://example.com/about",
            r#"<html><head><title>About us</title></head>
               <body><h1>About</h1><a href="/">Home</a></body></html>"#,
        )
}
