//! Property tests for module identifier parsing and tag selection

use module_host::module::registry::path::{
    expand, parse_tag_version, select_tag, storage_path, ModuleSource, FLOATING_TAG,
};
use proptest::prelude::*;
use std::path::Path;

fn segment() -> impl Strategy<Value = String> {
    "[A-Za-z0-9][A-Za-z0-9_.-]{0,15}".prop_filter("not a dot segment", |s| s != "." && s != "..")
}

fn release() -> impl Strategy<Value = (u64, u64, u64)> {
    (0u64..20, 0u64..20, 0u64..20)
}

proptest! {
    #[test]
    fn prop_remote_identifiers_roundtrip(
        owner in segment(),
        name in segment(),
        tag in proptest::option::of(segment()),
    ) {
        let identifier = match &tag {
            Some(tag) => format!("remote:{}/{}#{}", owner, name, tag),
            None => format!("remote:{}/{}", owner, name),
        };
        let source = expand(&identifier).expect("valid identifier");
        prop_assert_eq!(
            &source,
            &ModuleSource::Remote { owner: owner.clone(), name: name.clone(), tag: tag.clone() }
        );
        prop_assert_eq!(source.to_string(), identifier);
    }

    #[test]
    fn prop_unprefixed_words_are_rejected(word in "[A-Za-z0-9_-]{1,20}") {
        prop_assert!(expand(&word).is_none());
    }

    #[test]
    fn prop_missing_tag_selects_highest_release(
        releases in proptest::collection::vec(release(), 0..8),
        prereleases in proptest::collection::vec(release(), 0..4),
    ) {
        let mut tags: Vec<String> = releases
            .iter()
            .map(|(a, b, c)| format!("{}.{}.{}", a, b, c))
            .collect();
        tags.extend(prereleases.iter().map(|(a, b, c)| format!("v{}.{}.{}-beta", a + 1, b, c)));
        tags.push("main".to_string());

        let selected = select_tag(None, &tags).unwrap();
        match releases.iter().max() {
            Some((a, b, c)) => {
                let expected = semver::Version::new(*a, *b, *c);
                prop_assert_eq!(parse_tag_version(&selected), Some(expected));
            }
            None => prop_assert_eq!(selected, FLOATING_TAG),
        }
    }

    #[test]
    fn prop_existing_tag_is_kept(tags in proptest::collection::vec(segment(), 1..6), pick in 0usize..6) {
        let requested = tags[pick % tags.len()].clone();
        prop_assert_eq!(select_tag(Some(&requested), &tags).unwrap(), requested);
    }

    #[test]
    fn prop_storage_path_is_deterministic(owner in segment(), name in segment(), tag in segment()) {
        let source = ModuleSource::Remote { owner: owner.clone(), name: name.clone(), tag: Some(tag.clone()) };
        let root = Path::new("/storage");
        let first = storage_path(&source, root);
        prop_assert_eq!(&first, &storage_path(&source, root));
        prop_assert_eq!(first, root.join(&owner).join(format!("{}@{}", name, tag)));
    }
}

#[test]
fn test_floating_tag_is_kept_without_releases() {
    assert_eq!(select_tag(Some(FLOATING_TAG), &[]).unwrap(), FLOATING_TAG);
    assert!(select_tag(Some("9.9.9"), &["1.0.0".to_string()]).is_err());
}

#[test]
fn test_release_ordering_scenario() {
    let tags = vec!["1.0.0".to_string(), "1.2.0".to_string(), "2.0.0-beta".to_string()];
    assert_eq!(select_tag(None, &tags).unwrap(), "1.2.0");
}
