//! Template resolution: `{{variable}}` substitution and `{{a|b|c}}` spintax.
//!
//! Spintax alternatives are resolved first, then variables, so an
//! alternative may itself name a variable only if written as a separate
//! placeholder. Unknown variables resolve to an empty string.

use std::collections::HashMap;
use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([^{}]*)\}\}").expect("placeholder regex is valid")
});

/// Resolve a template with a thread-local RNG.
pub fn resolve(template: &str, vars: &HashMap<String, String>) -> String {
    resolve_with(template, vars, &mut rand::thread_rng())
}

/// Resolve a template with a caller-supplied RNG.
pub fn resolve_with<R: Rng>(
    template: &str,
    vars: &HashMap<String, String>,
    rng: &mut R,
) -> String {
    let spun = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let inner = &caps[1];
        if inner.contains('|') {
            let options: Vec<&str> = inner.split('|').collect();
            options[rng.gen_range(0..options.len())].to_string()
        } else {
            caps[0].to_string()
        }
    });

    PLACEHOLDER
        .replace_all(&spun, |caps: &regex::Captures<'_>| {
            vars.get(caps[1].trim()).cloned().unwrap_or_default()
        })
        .into_owned()
}
