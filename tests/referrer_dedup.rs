use browsing_shield::ReferrerCache;

#[test]
fn each_edge_is_reported_exactly_once() {
    let mut cache = ReferrerCache::new();
    assert!(cache.process("https://blog.example/post", "https://cdn.example/lib.js"));
    assert!(!cache.process("https://blog.example/other", "https://cdn.example/other.js"));

    // a different destination under the same referrer is a new edge
    assert!(cache.process("https://blog.example/post", "https://fonts.example/a.woff"));
    // and so is the same destination from a different referrer
    assert!(cache.process("https://news.example/", "https://cdn.example/lib.js"));
}

#[test]
fn same_host_pairs_are_never_reported() {
    let mut cache = ReferrerCache::new();
    assert!(!cache.process("https://shop.example/cart", "https://shop.example/api"));
    assert!(cache.is_empty());
}

#[test]
fn invalid_urls_are_treated_as_non_matches() {
    let mut cache = ReferrerCache::new();
    assert!(!cache.process("not a url", "https://cdn.example/"));
    assert!(!cache.process("https://blog.example/", "::::"));
    assert!(cache.is_empty());
}

#[test]
fn clear_resets_the_dedup_state() {
    let mut cache = ReferrerCache::new();
    assert!(cache.process("https://a.example/", "https://b.example/"));
    assert!(!cache.process("https://a.example/", "https://b.example/"));
    assert_eq!(cache.len(), 1);

    cache.clear();
    assert!(cache.is_empty());
    assert!(cache.process("https://a.example/", "https://b.example/"));
}

#[test]
fn hosts_are_compared_ignoring_path_and_scheme() {
    let mut cache = ReferrerCache::new();
    assert!(cache.process("https://a.example/x", "https://b.example/y"));
    assert!(!cache.process("http://a.example/z", "http://b.example/w"));
}
