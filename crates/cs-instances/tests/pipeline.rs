use std::io::Write;
use std::path::Path;

use cs_instances::{
    DiversitySelector, EmbeddingCache, ExtractorConfig, FeatureExtractor, InstanceCatalog,
    SelectorConfig,
};
use cs_types::InstanceId;
use flate2::write::GzEncoder;
use flate2::Compression;

/// A set-cover style model with `cols` binary columns and `rows` covering rows;
/// row `r` covers columns `r..r + width`.
fn cover_model(rows: usize, cols: usize, width: usize, continuous: usize) -> String {
    let mut text = String::from("NAME cover\nROWS\n N obj\n");
    for r in 0..rows {
        text.push_str(&format!(" G r{r}\n"));
    }
    text.push_str(" E link\nCOLUMNS\n    MARKER 'MARKER' 'INTORG'\n");
    for c in 0..cols {
        text.push_str(&format!("    x{c} obj 1\n"));
        for r in 0..rows {
            if c >= r && c < r + width {
                text.push_str(&format!("    x{c} r{r} 1\n"));
            }
        }
    }
    text.push_str("    MARKER 'MARKER' 'INTEND'\n");
    for y in 0..continuous {
        text.push_str(&format!("    y{y} link 1\n"));
    }
    text.push_str("RHS\n");
    for r in 0..rows {
        text.push_str(&format!("    rhs r{r} 1\n"));
    }
    text.push_str("    rhs link 1\nBOUNDS\n");
    for c in 0..cols {
        text.push_str(&format!(" BV bnd x{c}\n"));
    }
    text.push_str("ENDATA\n");
    text
}

fn write_plain(dir: &Path, name: &str, text: &str) {
    std::fs::write(dir.join(name), text).unwrap();
}

fn write_gz(dir: &Path, name: &str, text: &str) {
    let file = std::fs::File::create(dir.join(name)).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

#[test]
fn catalog_to_subset() {
    let pool = tempfile::tempdir().unwrap();
    for i in 0..8 {
        let text = cover_model(4 + i, 10 + 3 * i, 2 + i % 3, i);
        if i % 2 == 0 {
            write_gz(pool.path(), &format!("cover{i}.mps.gz"), &text);
        } else {
            write_plain(pool.path(), &format!("cover{i}.mps"), &text);
        }
    }
    write_plain(pool.path(), "broken.mps", "NAME broken\nROWS\n N obj\n");

    let catalog = InstanceCatalog::scan(pool.path(), None).unwrap();
    assert_eq!(catalog.len(), 9);

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = EmbeddingCache::open(cache_dir.path()).unwrap();
    let extractor = FeatureExtractor::new(ExtractorConfig::default().with_size_features(true));

    let report = extractor.embed_all(&catalog.instances(), Some(&cache));
    assert_eq!(report.embeddings.len(), 8);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].instance(), "broken");
    assert!(report
        .embeddings
        .iter()
        .all(|e| e.dimension() == extractor.config().dimension()));

    // Gzip and plain files of the same model embed identically.
    let text = cover_model(5, 12, 2, 1);
    let pair = tempfile::tempdir().unwrap();
    write_plain(pair.path(), "plain.mps", &text);
    write_gz(pair.path(), "packed.mps.gz", &text);
    let pair_catalog = InstanceCatalog::scan(pair.path(), None).unwrap();
    let pair_report = extractor.embed_all(&pair_catalog.instances(), None);
    assert_eq!(pair_report.embeddings[0].values, pair_report.embeddings[1].values);

    let selector = DiversitySelector::new(SelectorConfig::default().with_normalization(true));
    let subset = selector.select(&report.embeddings, 4).unwrap();
    assert_eq!(subset.len(), 4);
    assert!(!subset.contains(&InstanceId::new("broken")));

    let subset_path = pool.path().join("subset.json");
    subset.save(&subset_path).unwrap();
    let resolved = catalog
        .resolve(&cs_types::InstanceSubset::load(&subset_path).unwrap())
        .unwrap();
    assert_eq!(resolved.len(), 4);

    // A second pass is served from the on-disk cache.
    let reopened = EmbeddingCache::open(cache_dir.path()).unwrap();
    let again = extractor.embed_all(&catalog.instances(), Some(&reopened));
    assert_eq!(again.cache_hits, 8);
    assert_eq!(again.embeddings, report.embeddings);
}
