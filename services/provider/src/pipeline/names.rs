//! Object and host names of space deployments.

use rand::distr::Alphanumeric;
use rand::Rng;

pub fn namespace(wallet_address: &str) -> String {
    format!("ns-{}", wallet_address.to_lowercase())
}

pub fn deployment(space_uuid: &str) -> String {
    format!("deploy-{space_uuid}")
}

pub fn service(space_uuid: &str) -> String {
    format!("svc-{space_uuid}")
}

pub fn ingress(space_uuid: &str) -> String {
    format!("ing-{space_uuid}")
}

/// `len` random lowercase alphanumerics.
pub fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Join a host prefix with the public domain. A domain given as
/// `.example.org` is appended as is.
pub fn host(prefix: &str, domain: &str) -> String {
    if domain.starts_with('.') {
        format!("{prefix}{domain}")
    } else {
        format!("{prefix}.{domain}")
    }
}

/// Fresh public host for a space.
pub fn generate_host(domain: &str) -> String {
    host(&random_suffix(10), domain)
}

/// Image tag for a space built from its Dockerfile.
pub fn image_tag(space_name: &str, space_uuid: &str) -> String {
    let repo: String = space_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let repo = match repo.trim_matches('-') {
        "" => "space",
        trimmed => trimmed,
    };
    format!("lagrange/{repo}:{space_uuid}")
}

/// Space uuid carried as the last path segment of a job source URI.
pub fn space_uuid_from_source(job_source_uri: &str) -> String {
    job_source_uri
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_names() {
        assert_eq!(namespace("0xAbCd"), "ns-0xabcd");
        assert_eq!(deployment("u1"), "deploy-u1");
        assert_eq!(service("u1"), "svc-u1");
        assert_eq!(ingress("u1"), "ing-u1");
    }

    #[test]
    fn test_host_joins_domain() {
        assert_eq!(host("abc", ".example.org"), "abc.example.org");
        assert_eq!(host("abc", "example.org"), "abc.example.org");
    }

    #[test]
    fn test_generated_host_shape() {
        let h = generate_host(".example.org");
        let prefix = h.strip_suffix(".example.org").unwrap();
        assert_eq!(prefix.len(), 10);
        assert!(prefix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag("My Space!", "u1"), "lagrange/my-space:u1");
        assert_eq!(image_tag("__", "u1"), "lagrange/space:u1");
    }

    #[test]
    fn test_space_uuid_from_source() {
        assert_eq!(space_uuid_from_source("https://hub/spaces/ABC-123"), "abc-123");
        assert_eq!(space_uuid_from_source("https://hub/spaces/abc/"), "abc");
    }
}
