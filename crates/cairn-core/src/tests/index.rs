use std::collections::HashSet;

use crate::blob::{BlobHandle, BlobType};
use crate::crypto::id::Id;
use crate::error::CairnError;
use crate::index::file::{IndexBlob, IndexFile, IndexPack};
use crate::index::Index;
use crate::repo::pack::PackTrailerEntry;

fn entry(data: &[u8], blob_type: BlobType, offset: u64) -> PackTrailerEntry {
    PackTrailerEntry {
        id: Id::compute(data),
        blob_type,
        uncompressed_length: data.len() as u32,
        offset,
        length: 10,
    }
}

fn pack_id(byte: u8) -> Id {
    Id([byte; 32])
}

fn file_with(pack: Id, entries: &[PackTrailerEntry]) -> IndexFile {
    IndexFile {
        supersedes: Vec::new(),
        packs: vec![IndexPack {
            id: pack,
            blobs: entries.iter().map(IndexBlob::from).collect(),
        }],
    }
}

#[test]
fn new_index_is_empty() {
    let index = Index::new();
    assert!(index.is_empty());
    assert_eq!(index.len(), 0);
    assert!(!index.has_unsaved());
    assert!(index.packs().is_empty());
}

#[test]
fn store_pack_makes_blobs_visible() {
    let index = Index::new();
    let a = entry(b"a", BlobType::Data, 0);
    let b = entry(b"b", BlobType::Tree, 10);
    index.store_pack(pack_id(1), &[a.clone(), b.clone()]);

    assert!(index.has(&a.handle()));
    assert!(index.has(&b.handle()));
    assert!(!index.has(&BlobHandle::new(a.id, BlobType::Tree)));
    assert_eq!(index.count(BlobType::Data), 1);
    assert_eq!(index.count(BlobType::Tree), 1);
    assert!(index.has_unsaved());

    let found = index.lookup(&b.handle()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].pack_id, pack_id(1));
    assert_eq!(found[0].offset, 10);
    assert_eq!(found[0].uncompressed_length, 1);
}

#[test]
fn lookup_returns_copies_in_insertion_order() {
    let index = Index::new();
    let a = entry(b"a", BlobType::Data, 0);
    index.store_pack(pack_id(2), &[a.clone()]);
    index.store_pack(pack_id(1), &[a.clone()]);

    let packs: Vec<Id> = index
        .lookup(&a.handle())
        .unwrap()
        .iter()
        .map(|b| b.pack_id)
        .collect();
    assert_eq!(packs, vec![pack_id(2), pack_id(1)]);
    // still one distinct blob
    assert_eq!(index.len(), 1);
}

#[test]
fn merge_is_a_set_union() {
    let index = Index::new();
    let a = entry(b"a", BlobType::Data, 0);
    let file = file_with(pack_id(1), &[a.clone()]);

    assert!(index.merge_file(Id([7; 32]), &file));
    assert!(!index.merge_file(Id([7; 32]), &file));
    // same records under another file id collapse
    assert!(index.merge_file(Id([8; 32]), &file));
    assert_eq!(index.lookup(&a.handle()).unwrap().len(), 1);
    assert!(index.is_file_loaded(&Id([7; 32])));
    assert_eq!(index.files().len(), 2);
    // merged records are already persisted
    assert!(!index.has_unsaved());
}

#[test]
fn merge_keeps_records_naming_other_packs() {
    let index = Index::new();
    let a = entry(b"a", BlobType::Data, 0);
    index.merge_file(Id([7; 32]), &file_with(pack_id(1), &[a.clone()]));
    index.merge_file(Id([8; 32]), &file_with(pack_id(2), &[a.clone()]));
    assert_eq!(index.lookup(&a.handle()).unwrap().len(), 2);
}

#[test]
fn merge_records_superseded_files() {
    let index = Index::new();
    let mut file = file_with(pack_id(1), &[entry(b"a", BlobType::Data, 0)]);
    file.supersedes = vec![Id([3; 32]), Id([4; 32])];
    index.merge_file(Id([9; 32]), &file);
    assert_eq!(
        index.superseded().into_iter().collect::<Vec<_>>(),
        vec![Id([3; 32]), Id([4; 32])]
    );
}

#[test]
fn remove_packs_drops_their_records() {
    let index = Index::new();
    let a = entry(b"a", BlobType::Data, 0);
    let b = entry(b"b", BlobType::Data, 10);
    index.store_pack(pack_id(1), &[a.clone(), b.clone()]);
    index.store_pack(pack_id(2), &[a.clone()]);

    let removed = index.remove_packs(&HashSet::from([pack_id(1)]));
    assert_eq!(removed, 2);
    assert!(!index.has(&b.handle()));
    let left = index.lookup(&a.handle()).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].pack_id, pack_id(2));

    let overlay: Vec<Id> = index.take_overlay().iter().map(|p| p.id).collect();
    assert_eq!(overlay, vec![pack_id(2)]);

    assert!(matches!(
        index.lookup(&b.handle()),
        Err(CairnError::BlobNotFound(_))
    ));
}

#[test]
fn packs_are_grouped_and_sorted() {
    let index = Index::new();
    let a = entry(b"a", BlobType::Data, 20);
    let b = entry(b"b", BlobType::Data, 0);
    let c = entry(b"c", BlobType::Tree, 5);
    index.store_pack(pack_id(9), &[a.clone(), b.clone()]);
    index.store_pack(pack_id(3), &[c.clone()]);

    let packs = index.packs();
    assert_eq!(packs.len(), 2);
    assert_eq!(packs[0].id, pack_id(3));
    assert_eq!(packs[1].id, pack_id(9));
    let offsets: Vec<u64> = packs[1].blobs.iter().map(|b| b.offset).collect();
    assert_eq!(offsets, vec![0, 20]);
}

#[test]
fn full_rewrite_swaps_files() {
    let index = Index::new();
    let mut file = file_with(pack_id(1), &[entry(b"a", BlobType::Data, 0)]);
    file.supersedes = vec![Id([5; 32])];
    index.merge_file(Id([6; 32]), &file);
    index.store_pack(pack_id(2), &[entry(b"b", BlobType::Data, 0)]);

    let rewrite = index.begin_full_rewrite();
    assert_eq!(rewrite.packs.len(), 2);
    assert_eq!(rewrite.overlay.len(), 1);
    // an announced but never loaded file is not up for deletion
    assert_eq!(
        rewrite.old_files.iter().copied().collect::<Vec<_>>(),
        vec![Id([6; 32])]
    );
    assert!(!index.has_unsaved());

    // a pack stored during the rewrite stays unsaved
    index.store_pack(pack_id(3), &[entry(b"c", BlobType::Data, 0)]);

    let new_file = Id([10; 32]);
    index.finish_full_rewrite(&[new_file], &rewrite.old_files);
    assert_eq!(index.files().into_iter().collect::<Vec<_>>(), vec![new_file]);
    assert_eq!(
        index.superseded().into_iter().collect::<Vec<_>>(),
        vec![Id([5; 32]), Id([6; 32])]
    );
    assert!(index.has_unsaved());

    index.forget_superseded(&Id([5; 32]));
    assert_eq!(index.superseded().len(), 1);
}
