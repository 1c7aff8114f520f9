use crate::storage::{LineSource, VectorStorage};
use crate::{
    AccessError, ArchData, LayoutError, SegmentSpec, DEFAULT_INITIAL_FILL, HOST_WORD_SIZE,
};
use byteorder::{BigEndian, LittleEndian};

fn region(line_size: u64, size: u64) -> ArchData {
    let mut data = ArchData::new(line_size, DEFAULT_INITIAL_FILL, 1, true).unwrap();
    data.layout_range(size).unwrap();
    data
}

#[test]
fn line_size_must_be_power_of_two() {
    assert_eq!(
        ArchData::new(100, 0, 1, true).unwrap_err(),
        LayoutError::LineSizeNotPowerOfTwo(100)
    );
}

#[test]
fn fill_bits_above_pattern_are_rejected() {
    assert!(matches!(
        ArchData::new(64, 0x1_00, 1, true).unwrap_err(),
        LayoutError::FillOverflow { .. }
    ));
    ArchData::new(64, 0x1_00, 2, true).unwrap();
}

#[test]
fn fresh_lines_hold_the_fill_pattern() {
    let mut data = region(64, 256);
    let mut buf = [0u8; 4];
    data.read_bytes_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0xcc; 4]);
}

#[test]
fn multibyte_fill_is_phase_aligned() {
    // Line size 2 with a 4-byte pattern: the line at offset 2 starts in the
    // middle of the pattern.
    let mut data = ArchData::new(2, 0xddccbbaa, 4, true).unwrap();
    data.layout_range(8).unwrap();
    let mut buf = [0u8; 2];
    data.read_bytes_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0xaa, 0xbb]);
    data.read_bytes_at(2, &mut buf).unwrap();
    assert_eq!(buf, [0xcc, 0xdd]);
}

#[test]
fn typed_access_round_trips_byte_orders() {
    let mut data = region(64, 128);
    data.write_at::<u32, LittleEndian>(8, 0x1122_3344).unwrap();
    assert_eq!(data.read_at::<u32, LittleEndian>(8).unwrap(), 0x1122_3344);
    let mut raw = [0u8; 4];
    data.read_bytes_at(8, &mut raw).unwrap();
    assert_eq!(raw, [0x44, 0x33, 0x22, 0x11]);

    data.write_at::<u32, BigEndian>(16, 0x1122_3344).unwrap();
    data.read_bytes_at(16, &mut raw).unwrap();
    assert_eq!(raw, [0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn access_is_bounds_checked() {
    let mut data = region(64, 128);
    assert!(matches!(
        data.write_bytes_at(130, &[0]),
        Err(AccessError::OutOfRange { .. })
    ));
    let line = data.line_at(0).unwrap();
    assert!(matches!(
        line.read::<u64, LittleEndian>(60, 0),
        Err(AccessError::OutOfBounds { .. })
    ));
}

#[test]
fn unbounded_line_size_uses_one_line() {
    let mut data = region(0, 4096);
    assert_eq!(data.line_index(4000), 0);
    data.write_bytes_at(4000, &[1, 2, 3]).unwrap();
    assert_eq!(data.num_allocated_lines(), 1);
    let line = data.line_at(0).unwrap();
    assert_eq!(line.size(), 4096);
}

#[test]
fn save_emits_only_dirty_lines() {
    let mut data = region(64, 256);
    data.write_bytes_at(0, &[1]).unwrap();
    data.write_bytes_at(128, &[2]).unwrap();

    let mut storage = VectorStorage::new();
    data.save(&mut storage).unwrap();
    // Two dirty lines plus the end marker.
    assert_eq!(storage.len(), 3);

    // Dirty bits cleared: a second save emits nothing but the marker.
    let mut second = VectorStorage::new();
    data.save(&mut second).unwrap();
    assert_eq!(second.len(), 1);
}

#[test]
fn save_all_emits_clean_lines_too() {
    let mut data = region(64, 256);
    data.write_bytes_at(0, &[1]).unwrap();
    let mut storage = VectorStorage::new();
    data.save(&mut storage).unwrap();

    let mut all = VectorStorage::new();
    data.save_all(&mut all).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn snapshot_round_trip_restores_bytes() {
    let mut data = region(64, 256);
    data.write_bytes_at(5, &[0xde, 0xad]).unwrap();
    data.write_bytes_at(200, &[0xbe, 0xef]).unwrap();

    let mut storage = VectorStorage::new();
    data.save_all(&mut storage).unwrap();

    data.write_bytes_at(5, &[0, 0]).unwrap();
    data.write_bytes_at(100, &[7]).unwrap();

    storage.prepare_for_load();
    data.restore_all(&mut storage).unwrap();

    let mut buf = [0u8; 2];
    data.read_bytes_at(5, &mut buf).unwrap();
    assert_eq!(buf, [0xde, 0xad]);
    data.read_bytes_at(200, &mut buf).unwrap();
    assert_eq!(buf, [0xbe, 0xef]);
    // The line written after the save went back to the fill pattern.
    let mut one = [0u8; 1];
    data.read_bytes_at(100, &mut one).unwrap();
    assert_eq!(one, [0xcc]);
}

#[test]
fn restore_all_drops_lines_missing_from_the_snapshot() {
    let mut data = region(64, 256);
    data.write_bytes_at(0, &[1]).unwrap();
    let mut storage = VectorStorage::new();
    data.save_all(&mut storage).unwrap();

    data.write_bytes_at(128, &[9]).unwrap();
    assert_eq!(data.num_allocated_lines(), 2);

    storage.prepare_for_load();
    data.restore_all(&mut storage).unwrap();
    assert_eq!(data.num_allocated_lines(), 1);
}

#[test]
fn delta_restore_keeps_untouched_lines() {
    let mut data = region(64, 256);
    data.write_bytes_at(0, &[1]).unwrap();
    let mut base = VectorStorage::new();
    data.save(&mut base).unwrap();

    data.write_bytes_at(64, &[2]).unwrap();
    let mut delta = VectorStorage::new();
    data.save(&mut delta).unwrap();

    data.write_bytes_at(64, &[0xff]).unwrap();
    delta.prepare_for_load();
    data.restore(&mut delta).unwrap();

    let mut buf = [0u8; 1];
    data.read_bytes_at(0, &mut buf).unwrap();
    assert_eq!(buf, [1]);
    data.read_bytes_at(64, &mut buf).unwrap();
    assert_eq!(buf, [2]);
}

#[test]
fn clean_refills_when_lines_cannot_be_freed() {
    let mut data = ArchData::new(64, 0xaa, 1, false).unwrap();
    data.layout_range(128).unwrap();
    data.write_bytes_at(0, &[1, 2, 3]).unwrap();
    data.clean().unwrap();
    assert_eq!(data.num_allocated_lines(), 1);
    let mut buf = [0u8; 3];
    data.read_bytes_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0xaa; 3]);
}

#[test]
fn layout_places_roots_word_aligned() {
    let mut data = ArchData::new(64, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(1, 1)).unwrap();
    data.register_segment(SegmentSpec::new(2, 4)).unwrap();
    data.layout().unwrap();

    assert_eq!(data.segment(1).unwrap().offset(), Some(0));
    assert_eq!(data.segment(2).unwrap().offset(), Some(HOST_WORD_SIZE));
    assert_eq!(data.padding_waste(), HOST_WORD_SIZE - 1);
}

#[test]
fn layout_pads_to_avoid_line_straddle() {
    let mut data = ArchData::new(16, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(1, 8)).unwrap();
    data.register_segment(SegmentSpec::new(2, 16)).unwrap();
    data.layout().unwrap();

    // Segment 2 cannot start at offset 8 inside line 0.
    assert_eq!(data.segment(2).unwrap().offset(), Some(16));
    assert_eq!(data.line_waste(), 8);
}

#[test]
fn subset_segments_land_inside_their_parent() {
    let mut data = ArchData::new(64, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(10, 16)).unwrap();
    data.register_segment(SegmentSpec::new(11, 4).subset_of(10, 8))
        .unwrap();
    data.layout().unwrap();

    let parent = data.segment(10).unwrap().offset().unwrap();
    assert_eq!(data.segment(11).unwrap().offset(), Some(parent + 8));
}

#[test]
fn subset_conflicts_are_layout_errors() {
    let mut data = ArchData::new(64, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(1, 8).subset_of(99, 0))
        .unwrap();
    assert!(matches!(
        data.layout().unwrap_err(),
        LayoutError::UnknownParent { id: 1, parent: 99 }
    ));

    let mut data = ArchData::new(64, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(1, 8)).unwrap();
    data.register_segment(SegmentSpec::new(2, 8).subset_of(1, 4))
        .unwrap();
    assert!(matches!(
        data.layout().unwrap_err(),
        LayoutError::SubsetOverflow { id: 2, .. }
    ));
}

#[test]
fn registration_conflicts_are_rejected() {
    let mut data = ArchData::new(64, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(1, 8)).unwrap();
    assert_eq!(
        data.register_segment(SegmentSpec::new(1, 8)).unwrap_err(),
        LayoutError::DuplicateSegment(1)
    );
    assert!(matches!(
        data.register_segment(SegmentSpec::new(2, 128)).unwrap_err(),
        LayoutError::SegmentExceedsLine { id: 2, .. }
    ));
    assert!(matches!(
        data.register_segment(SegmentSpec::new(3, 12)).unwrap_err(),
        LayoutError::SegmentSizeNotPowerOfTwo { id: 3, .. }
    ));
}

#[test]
fn layout_is_one_shot() {
    let mut data = region(64, 128);
    assert_eq!(data.layout().unwrap_err(), LayoutError::AlreadyLaidOut);
    assert_eq!(
        data.register_segment(SegmentSpec::new(1, 8)).unwrap_err(),
        LayoutError::AlreadyLaidOut
    );
}

#[test]
fn reset_replays_segment_initializers() {
    let mut data = ArchData::new(64, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(1, 4).initial(vec![9, 8, 7, 6]))
        .unwrap();
    data.layout().unwrap();

    let offset = data.segment(1).unwrap().offset().unwrap();
    let mut buf = [0u8; 4];
    data.read_bytes_at(offset, &mut buf).unwrap();
    assert_eq!(buf, [9, 8, 7, 6]);

    data.write_bytes_at(offset, &[0; 4]).unwrap();
    data.reset().unwrap();
    data.read_bytes_at(offset, &mut buf).unwrap();
    assert_eq!(buf, [9, 8, 7, 6]);
}

#[test]
fn views_are_segment_bounded() {
    let mut data = ArchData::new(64, 0, 1, true).unwrap();
    data.register_segment(SegmentSpec::new(1, 8)).unwrap();
    data.layout().unwrap();

    let mut view = data.view(1).unwrap();
    view.write::<u32, LittleEndian>(0xabcd, 1).unwrap();
    assert_eq!(view.read::<u32, LittleEndian>(1).unwrap(), 0xabcd);
    assert!(matches!(
        view.read::<u32, LittleEndian>(2),
        Err(AccessError::OutOfBounds { .. })
    ));
}

#[test]
fn update_from_copies_allocated_lines() {
    let mut a = region(64, 256);
    a.write_bytes_at(0, &[1, 2]).unwrap();
    a.write_bytes_at(128, &[3]).unwrap();

    let mut b = region(64, 256);
    b.update_from(&a).unwrap();
    let mut buf = [0u8; 2];
    b.read_bytes_at(0, &mut buf).unwrap();
    assert_eq!(buf, [1, 2]);
    assert_eq!(b.num_allocated_lines(), 2);
}

#[test]
fn line_states_show_dirtiness() {
    let mut data = region(64, 256);
    data.write_bytes_at(0, &[1]).unwrap();
    let mut storage = VectorStorage::new();
    data.save(&mut storage).unwrap();
    data.write_bytes_at(64, &[1]).unwrap();

    let states = data.line_states();
    assert_eq!(states.len(), 2);
    assert!(states[0].ends_with(":c"));
    assert!(states[1].ends_with(":d"));
}
