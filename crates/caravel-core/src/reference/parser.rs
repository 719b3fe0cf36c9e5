//! Reference parser: raw input plus flags into a structured reference.

use super::{ModuleReference, ModuleVersion, ParsedFlags, Scheme, Submodule};
use crate::error::{Error, Result};

/// Parse a raw reference string and explicit flags into a [`ModuleReference`].
///
/// Dispatch order:
/// 1. `--oci` / `--git` flags; a positional `raw`, when present, names a
///    submodule inside the flagged artifact.
/// 2. `oci://` / `git://` prefixes on `raw`.
/// 3. Local filesystem path; an absent `raw` defaults to the current
///    working directory.
pub fn parse(raw: Option<&str>, flags: &ParsedFlags) -> Result<ModuleReference> {
    if flags.oci.is_some() && flags.git.is_some() {
        return Err(Error::invalid_reference(
            raw.unwrap_or_default(),
            "--oci and --git are mutually exclusive",
        ));
    }

    if let Some(url) = &flags.oci {
        return parse_flagged(Scheme::Oci, url, raw, flags);
    }
    if let Some(url) = &flags.git {
        return parse_flagged(Scheme::Git, url, raw, flags);
    }

    let raw = raw.unwrap_or_default();
    if let Some(rest) = raw.strip_prefix("oci://") {
        return parse_prefixed_oci(raw, rest, flags);
    }
    if let Some(rest) = raw.strip_prefix("git://") {
        // The original CLI serves git:// coordinates over smart HTTP.
        let location = format!("https://{rest}");
        return Ok(ModuleReference {
            scheme: Scheme::Git,
            location,
            version: version_from_flags(flags, raw, Scheme::Git)?,
            submodule: None,
        });
    }

    parse_local(raw, flags)
}

/// Build a reference from a scheme flag URL plus an optional positional
/// submodule path.
fn parse_flagged(
    scheme: Scheme,
    url: &str,
    raw: Option<&str>,
    flags: &ParsedFlags,
) -> Result<ModuleReference> {
    let location = match scheme {
        Scheme::Oci => normalize_oci_location(url)?,
        Scheme::Git => normalize_git_location(url),
        Scheme::Local => unreachable!("local references carry no scheme flag"),
    };

    let submodule = match raw {
        None | Some("") => None,
        Some(path) => {
            let (path, version) = split_inline_version(path);
            Some(Submodule { path, version })
        }
    };

    Ok(ModuleReference {
        scheme,
        location,
        version: version_from_flags(flags, url, scheme)?,
        submodule,
    })
}

/// Parse an `oci://host/repo` (optionally `:tag`) prefixed reference.
fn parse_prefixed_oci(raw: &str, rest: &str, flags: &ParsedFlags) -> Result<ModuleReference> {
    let (location, inline_tag) = split_inline_version(rest);
    let flag_version = version_from_flags(flags, raw, Scheme::Oci)?;

    let version = match (inline_tag, flag_version) {
        (Some(_), Some(_)) => {
            return Err(Error::invalid_reference(
                raw,
                "tag given both inline and via --tag",
            ));
        }
        (Some(tag), None) => Some(ModuleVersion::Tag(tag)),
        (None, v) => v,
    };

    if !location.contains('/') {
        return Err(Error::invalid_reference(
            raw,
            "an OCI reference needs the form host/repository",
        ));
    }

    Ok(ModuleReference {
        scheme: Scheme::Oci,
        location,
        version,
        submodule: None,
    })
}

/// Treat `raw` as a filesystem path; empty means the working directory.
fn parse_local(raw: &str, flags: &ParsedFlags) -> Result<ModuleReference> {
    if flags.tag.is_some() || flags.branch.is_some() || flags.commit.is_some() {
        return Err(Error::invalid_reference(
            raw,
            "version flags apply only to oci:// or git references",
        ));
    }

    if raw.is_empty() {
        let cwd = std::env::current_dir().map_err(|_| {
            Error::invalid_reference("", "no input given and no usable working directory")
        })?;
        return Ok(ModuleReference::local(cwd.to_string_lossy().into_owned()));
    }

    Ok(ModuleReference::local(raw))
}

/// Reduce an OCI flag URL to the `host/repo` coordinate. The original CLI
/// accepts `--oci https://ghcr.io/...` as well as bare hosts.
fn normalize_oci_location(url: &str) -> Result<String> {
    let stripped = url
        .strip_prefix("oci://")
        .or_else(|| url.strip_prefix("https://"))
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .trim_end_matches('/');

    if !stripped.contains('/') {
        return Err(Error::invalid_reference(
            url,
            "an OCI reference needs the form host/repository",
        ));
    }
    Ok(stripped.to_string())
}

/// Keep git URLs as given, except `git://` which is served over smart HTTP.
fn normalize_git_location(url: &str) -> String {
    match url.strip_prefix("git://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

/// Map `--tag` / `--branch` / `--commit` to at most one version.
fn version_from_flags(
    flags: &ParsedFlags,
    input: &str,
    scheme: Scheme,
) -> Result<Option<ModuleVersion>> {
    let set = [&flags.tag, &flags.branch, &flags.commit]
        .iter()
        .filter(|v| v.is_some())
        .count();
    if set > 1 {
        return Err(Error::invalid_reference(
            input,
            "at most one of --tag, --branch, --commit may be given",
        ));
    }
    if scheme == Scheme::Oci && (flags.branch.is_some() || flags.commit.is_some()) {
        return Err(Error::invalid_reference(
            input,
            "--branch and --commit apply only to git references",
        ));
    }

    Ok(if let Some(tag) = &flags.tag {
        Some(ModuleVersion::Tag(tag.clone()))
    } else if let Some(branch) = &flags.branch {
        Some(ModuleVersion::Branch(branch.clone()))
    } else {
        flags.commit.clone().map(ModuleVersion::Commit)
    })
}

/// Split an inline `name:version` suffix off the final path segment.
///
/// Only the final segment is considered, and only suffixes that look like a
/// version: a colon followed by path separators (Windows drive paths, URL
/// fragments) is left alone.
fn split_inline_version(raw: &str) -> (String, Option<String>) {
    let seg_start = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
    if let Some((name, version)) = raw[seg_start..].split_once(':')
        && !name.is_empty()
        && !version.is_empty()
        && !version.contains('/')
        && !version.contains('\\')
    {
        return (
            format!("{}{}", &raw[..seg_start], name),
            Some(version.to_string()),
        );
    }
    (raw.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oci_flags(url: &str, tag: Option<&str>) -> ParsedFlags {
        ParsedFlags {
            oci: Some(url.to_string()),
            tag: tag.map(str::to_string),
            ..ParsedFlags::default()
        }
    }

    fn git_flags(url: &str) -> ParsedFlags {
        ParsedFlags {
            git: Some(url.to_string()),
            ..ParsedFlags::default()
        }
    }

    #[test]
    fn oci_prefix_with_tag_flag() {
        let flags = ParsedFlags {
            tag: Some("0.1.0".to_string()),
            ..ParsedFlags::default()
        };
        let r = parse(Some("oci://ghcr.io/kcl-lang/helloworld"), &flags).unwrap();
        assert_eq!(r.scheme, Scheme::Oci);
        assert_eq!(r.location, "ghcr.io/kcl-lang/helloworld");
        assert_eq!(r.version, Some(ModuleVersion::Tag("0.1.0".to_string())));
        assert_eq!(r.submodule, None);
    }

    #[test]
    fn oci_prefix_with_inline_tag() {
        let r = parse(
            Some("oci://ghcr.io/kcl-lang/helloworld:0.1.0"),
            &ParsedFlags::default(),
        )
        .unwrap();
        assert_eq!(r.location, "ghcr.io/kcl-lang/helloworld");
        assert_eq!(r.version, Some(ModuleVersion::Tag("0.1.0".to_string())));
    }

    #[test]
    fn oci_inline_and_flag_tag_conflict() {
        let flags = ParsedFlags {
            tag: Some("0.2.0".to_string()),
            ..ParsedFlags::default()
        };
        let err = parse(Some("oci://ghcr.io/kcl-lang/helloworld:0.1.0"), &flags).unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));
    }

    #[test]
    fn git_prefix_rewrites_to_https() {
        let flags = ParsedFlags {
            commit: Some("ade147b".to_string()),
            ..ParsedFlags::default()
        };
        let r = parse(
            Some("git://github.com/kcl-lang/flask-demo-kcl-manifests"),
            &flags,
        )
        .unwrap();
        assert_eq!(r.scheme, Scheme::Git);
        assert_eq!(
            r.location,
            "https://github.com/kcl-lang/flask-demo-kcl-manifests"
        );
        assert_eq!(r.version, Some(ModuleVersion::Commit("ade147b".to_string())));
    }

    #[test]
    fn oci_flag_takes_positional_submodule() {
        let r = parse(
            Some("subhelloworld"),
            &oci_flags("https://ghcr.io/kcl-lang/helloworld", Some("0.1.4")),
        )
        .unwrap();
        assert_eq!(r.location, "ghcr.io/kcl-lang/helloworld");
        assert_eq!(r.version, Some(ModuleVersion::Tag("0.1.4".to_string())));
        let sub = r.submodule.unwrap();
        assert_eq!(sub.path, "subhelloworld");
        assert_eq!(sub.version, None);
    }

    #[test]
    fn inline_submodule_version_round_trips() {
        let flags = oci_flags("ghcr.io/kcl-lang/helloworld", Some("0.1.4"));
        let r = parse(Some("subhelloworld:0.0.1"), &flags).unwrap();
        let sub = r.submodule.clone().unwrap();
        assert_eq!(sub.path, "subhelloworld");
        assert_eq!(sub.version.as_deref(), Some("0.0.1"));

        // Re-serialize the submodule and parse it again.
        let again = parse(Some(&sub.to_string()), &flags).unwrap();
        assert_eq!(again, r);
    }

    #[test]
    fn inline_split_applies_to_final_segment_only() {
        let (path, version) = split_inline_version("nested/dir/sub:1.2.3");
        assert_eq!(path, "nested/dir/sub");
        assert_eq!(version.as_deref(), Some("1.2.3"));

        // Colon in a non-final segment is untouched.
        let (path, version) = split_inline_version("odd:name/sub");
        assert_eq!(path, "odd:name/sub");
        assert_eq!(version, None);
    }

    #[test]
    fn windows_drive_path_is_not_split() {
        let (path, version) = split_inline_version(r"C:\pkgs\sub");
        assert_eq!(path, r"C:\pkgs\sub");
        assert_eq!(version, None);
    }

    #[test]
    fn conflicting_scheme_flags_fail() {
        let flags = ParsedFlags {
            oci: Some("ghcr.io/a/b".to_string()),
            git: Some("https://github.com/a/b".to_string()),
            ..ParsedFlags::default()
        };
        assert!(matches!(
            parse(None, &flags),
            Err(Error::InvalidReference { .. })
        ));
    }

    #[test]
    fn multiple_git_version_flags_fail() {
        let mut flags = git_flags("https://github.com/a/b");
        flags.branch = Some("main".to_string());
        flags.commit = Some("abc1234".to_string());
        assert!(matches!(
            parse(None, &flags),
            Err(Error::InvalidReference { .. })
        ));
    }

    #[test]
    fn git_flag_without_ref_uses_default_branch() {
        let r = parse(None, &git_flags("https://github.com/a/b")).unwrap();
        assert_eq!(r.scheme, Scheme::Git);
        assert_eq!(r.version, None);
    }

    #[test]
    fn git_branch_flags_apply() {
        let mut flags = git_flags("ssh://github.com/kcl-lang/flask-demo-kcl-manifests");
        flags.branch = Some("main".to_string());
        let r = parse(None, &flags).unwrap();
        assert_eq!(
            r.location,
            "ssh://github.com/kcl-lang/flask-demo-kcl-manifests"
        );
        assert_eq!(r.version, Some(ModuleVersion::Branch("main".to_string())));
    }

    #[test]
    fn oci_rejects_git_ref_flags() {
        let mut flags = oci_flags("ghcr.io/a/b", None);
        flags.commit = Some("abc".to_string());
        assert!(matches!(
            parse(None, &flags),
            Err(Error::InvalidReference { .. })
        ));
    }

    #[test]
    fn bare_path_is_local() {
        let r = parse(Some("path/to/module"), &ParsedFlags::default()).unwrap();
        assert_eq!(r.scheme, Scheme::Local);
        assert_eq!(r.location, "path/to/module");
        assert_eq!(r.version, None);
    }

    #[test]
    fn empty_input_defaults_to_working_directory() {
        let r = parse(None, &ParsedFlags::default()).unwrap();
        assert_eq!(r.scheme, Scheme::Local);
        assert!(!r.location.is_empty());
    }

    #[test]
    fn local_path_rejects_version_flags() {
        let flags = ParsedFlags {
            tag: Some("1.0.0".to_string()),
            ..ParsedFlags::default()
        };
        assert!(matches!(
            parse(Some("./module"), &flags),
            Err(Error::InvalidReference { .. })
        ));
    }
}
