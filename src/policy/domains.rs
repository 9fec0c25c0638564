//! Static domain-category registry for browser policy checks.
//!
//! Classification matches the URL's hostname and each dotted suffix
//! against the registry, so `online.chase.com` inherits `chase.com`'s
//! categories.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainCategory {
    Financial,
    SocialMedia,
    Adult,
    Gambling,
    Shopping,
    News,
    Webmail,
    Cloud,
    DevTools,
}

const REGISTRY: &[(&str, DomainCategory)] = &[
    // Banking, brokerage, payments
    ("chase.com", DomainCategory::Financial),
    ("bankofamerica.com", DomainCategory::Financial),
    ("wellsfargo.com", DomainCategory::Financial),
    ("citi.com", DomainCategory::Financial),
    ("capitalone.com", DomainCategory::Financial),
    ("fidelity.com", DomainCategory::Financial),
    ("schwab.com", DomainCategory::Financial),
    ("vanguard.com", DomainCategory::Financial),
    ("paypal.com", DomainCategory::Financial),
    ("stripe.com", DomainCategory::Financial),
    ("coinbase.com", DomainCategory::Financial),
    // Social
    ("facebook.com", DomainCategory::SocialMedia),
    ("instagram.com", DomainCategory::SocialMedia),
    ("twitter.com", DomainCategory::SocialMedia),
    ("x.com", DomainCategory::SocialMedia),
    ("tiktok.com", DomainCategory::SocialMedia),
    ("reddit.com", DomainCategory::SocialMedia),
    ("linkedin.com", DomainCategory::SocialMedia),
    // Adult
    ("onlyfans.com", DomainCategory::Adult),
    ("pornhub.com", DomainCategory::Adult),
    // Gambling
    ("bet365.com", DomainCategory::Gambling),
    ("draftkings.com", DomainCategory::Gambling),
    ("fanduel.com", DomainCategory::Gambling),
    ("pokerstars.com", DomainCategory::Gambling),
    // Shopping
    ("amazon.com", DomainCategory::Shopping),
    ("ebay.com", DomainCategory::Shopping),
    ("etsy.com", DomainCategory::Shopping),
    ("walmart.com", DomainCategory::Shopping),
    // News
    ("cnn.com", DomainCategory::News),
    ("bbc.com", DomainCategory::News),
    ("nytimes.com", DomainCategory::News),
    ("reuters.com", DomainCategory::News),
    // Webmail
    ("gmail.com", DomainCategory::Webmail),
    ("mail.google.com", DomainCategory::Webmail),
    ("outlook.com", DomainCategory::Webmail),
    ("mail.yahoo.com", DomainCategory::Webmail),
    ("proton.me", DomainCategory::Webmail),
    // Cloud consoles
    ("console.aws.amazon.com", DomainCategory::Cloud),
    ("portal.azure.com", DomainCategory::Cloud),
    ("console.cloud.google.com", DomainCategory::Cloud),
    ("cloud.digitalocean.com", DomainCategory::Cloud),
    // Developer tooling
    ("github.com", DomainCategory::DevTools),
    ("gitlab.com", DomainCategory::DevTools),
    ("bitbucket.org", DomainCategory::DevTools),
    ("crates.io", DomainCategory::DevTools),
    ("npmjs.com", DomainCategory::DevTools),
    ("pypi.org", DomainCategory::DevTools),
];

/// Classify a URL's hostname against the registry. Unknown or
/// unparseable URLs classify as empty.
pub fn classify_domain(raw_url: &str) -> Vec<DomainCategory> {
    let Ok(parsed) = url::Url::parse(raw_url) else {
        return Vec::new();
    };
    let Some(host) = parsed.host_str() else {
        return Vec::new();
    };
    let host = host.to_ascii_lowercase();

    let mut categories = Vec::new();
    // The hostname itself, then each dotted suffix.
    let mut candidate: &str = &host;
    loop {
        for (domain, category) in REGISTRY {
            if *domain == candidate && !categories.contains(category) {
                categories.push(*category);
            }
        }
        match candidate.split_once('.') {
            Some((_, rest)) if rest.contains('.') => candidate = rest,
            _ => break,
        }
    }
    categories
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_domains() {
        assert_eq!(
            classify_domain("https://chase.com/login"),
            vec![DomainCategory::Financial]
        );
        assert_eq!(
            classify_domain("https://github.com/org/repo"),
            vec![DomainCategory::DevTools]
        );
    }

    #[test]
    fn matches_dotted_suffixes() {
        assert_eq!(
            classify_domain("https://online.chase.com/accounts"),
            vec![DomainCategory::Financial]
        );
        assert_eq!(
            classify_domain("https://secure.www.paypal.com/"),
            vec![DomainCategory::Financial]
        );
    }

    #[test]
    fn specific_subdomains_do_not_leak_to_parents() {
        // aws console is Cloud; bare amazon.com is Shopping.
        assert_eq!(
            classify_domain("https://console.aws.amazon.com/ec2"),
            vec![DomainCategory::Cloud, DomainCategory::Shopping]
        );
        assert_eq!(
            classify_domain("https://amazon.com/"),
            vec![DomainCategory::Shopping]
        );
    }

    #[test]
    fn unknown_and_invalid_urls_classify_empty() {
        assert!(classify_domain("https://example.com/").is_empty());
        assert!(classify_domain("not a url").is_empty());
    }
}
