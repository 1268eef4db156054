//! Transfer mode resolution.

use crate::jobs::TransferMode;
use crate::workers::PathMapping;

/// Resolved mode plus the path the worker should read, when it can read one directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMode {
    pub mode: TransferMode,
    pub worker_path: Option<String>,
}

/// Decide how a source reaches a worker.
///
/// The longest matching `source_prefix` wins; equal-length prefixes keep their configured
/// order. Empty prefixes never match. Without a mapping a local worker reads the file
/// directly unless the origin is an SSH host, and a remote worker gets the file uploaded.
pub fn resolve(
    source_path: &str,
    worker_is_local: bool,
    path_mappings: &[PathMapping],
    origin_has_ssh: bool,
) -> ResolvedMode {
    let mut mappings: Vec<&PathMapping> = path_mappings
        .iter()
        .filter(|m| !m.source_prefix.is_empty())
        .collect();
    // stable sort keeps configured order among equal lengths
    mappings.sort_by(|a, b| b.source_prefix.len().cmp(&a.source_prefix.len()));

    if let Some(mapping) = mappings
        .iter()
        .find(|m| source_path.starts_with(m.source_prefix.as_str()))
    {
        let rest = &source_path[mapping.source_prefix.len()..];
        return ResolvedMode {
            mode: TransferMode::Mapped,
            worker_path: Some(format!("{}{}", mapping.target_prefix, rest)),
        };
    }

    match (worker_is_local, origin_has_ssh) {
        (true, true) => ResolvedMode {
            mode: TransferMode::SshPull,
            worker_path: None,
        },
        (true, false) => ResolvedMode {
            mode: TransferMode::Local,
            worker_path: Some(source_path.to_string()),
        },
        (false, _) => ResolvedMode {
            mode: TransferMode::SshTransfer,
            worker_path: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mapping(src: &str, dst: &str) -> PathMapping {
        PathMapping {
            source_prefix: src.to_string(),
            target_prefix: dst.to_string(),
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mappings = vec![
            mapping("/media", "/mnt/all"),
            mapping("/media/movies", "/mnt/movies"),
        ];
        let resolved = resolve("/media/movies/Film.mkv", false, &mappings, false);
        assert_eq!(resolved.mode, TransferMode::Mapped);
        assert_eq!(resolved.worker_path.as_deref(), Some("/mnt/movies/Film.mkv"));
    }

    #[test]
    fn test_fallbacks_without_mapping() {
        let local = resolve("/media/a.mkv", true, &[], false);
        assert_eq!(local.mode, TransferMode::Local);
        assert_eq!(local.worker_path.as_deref(), Some("/media/a.mkv"));

        let pull = resolve("/media/a.mkv", true, &[], true);
        assert_eq!(pull.mode, TransferMode::SshPull);
        assert_eq!(pull.worker_path, None);

        let remote = resolve("/media/a.mkv", false, &[], true);
        assert_eq!(remote.mode, TransferMode::SshTransfer);
        assert_eq!(remote.worker_path, None);
    }

    #[test]
    fn test_empty_prefix_never_matches() {
        let resolved = resolve("/media/a.mkv", false, &[mapping("", "/mnt")], false);
        assert_eq!(resolved.mode, TransferMode::SshTransfer);
    }

    #[test]
    fn test_equal_length_prefixes_keep_order() {
        let mappings = vec![mapping("/media", "/first"), mapping("/media", "/second")];
        let resolved = resolve("/media/a.mkv", false, &mappings, false);
        assert_eq!(resolved.worker_path.as_deref(), Some("/first/a.mkv"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_longest_prefix_regardless_of_order(
            depth in 1usize..5,
            extra in proptest::collection::vec("[a-z]{1,6}", 0..4),
            seed in any::<u64>(),
            is_local in any::<bool>(),
            origin_ssh in any::<bool>(),
        ) {
            let segments = ["media", "tv", "shows", "drama", "s01"];
            let deepest = format!("/{}", segments[..depth].join("/"));
            let source = format!("{}/episode.mkv", deepest);

            let mut mappings: Vec<PathMapping> = (1..=depth)
                .map(|n| {
                    let prefix = format!("/{}", segments[..n].join("/"));
                    mapping(&prefix, &format!("/mnt/{}", n))
                })
                .collect();
            mappings.extend(extra.iter().map(|e| mapping(&format!("/other/{}", e), "/x")));

            // deterministic shuffle
            let len = mappings.len();
            let mut state = seed;
            for i in (1..len).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                mappings.swap(i, j);
            }

            let resolved = resolve(&source, is_local, &mappings, origin_ssh);
            prop_assert_eq!(resolved.mode, TransferMode::Mapped);
            let expected = format!("/mnt/{}/episode.mkv", depth);
            prop_assert_eq!(resolved.worker_path, Some(expected));
        }

        #[test]
        fn prop_resolve_is_idempotent(
            path in "/[a-z]{1,8}/[a-z]{1,8}\\.mkv",
            is_local in any::<bool>(),
            origin_ssh in any::<bool>(),
        ) {
            let mappings = vec![mapping("/media", "/mnt/media")];
            let first = resolve(&path, is_local, &mappings, origin_ssh);
            let second = resolve(&path, is_local, &mappings, origin_ssh);
            prop_assert_eq!(first, second);
        }
    }
}
