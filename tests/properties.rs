use std::time::{Duration, Instant};

use image::Rgba;
use paintstack::compositor::composite;
use paintstack::history::{LayerProps, LayerPropsCommand, OperationKind, UndoHistory};
use paintstack::io::{decode_pfs, encode_pfs};
use paintstack::ops::layer_ops;
use paintstack::{BlendMode, CoreError, Layer, LayerStack, LayerTransform, Point};

const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

fn history(max: usize) -> UndoHistory {
    UndoHistory::new(max, Duration::ZERO)
}

#[test]
fn flattening_a_pass_through_group_keeps_the_composite() {
    let mut stack = LayerStack::with_background(12, 9, BLUE).unwrap();
    let root = stack.root_id();
    let g = stack.insert_layer(root, 1, Layer::new_group("g").with_isolate(false)).unwrap();
    stack
        .insert_layer(g, 0, Layer::new_filled("a", 6, 6, Rgba([10, 200, 30, 255])).unwrap().with_position(1, 1))
        .unwrap();
    stack
        .insert_layer(g, 1, Layer::new_filled("b", 5, 4, Rgba([200, 20, 90, 120])).unwrap().with_position(5, 3))
        .unwrap();

    let before = composite(&stack);
    let mut h = history(10);
    layer_ops::flatten_group(&mut stack, &mut h, g).unwrap();
    assert_eq!(stack.layer_count(), 2);
    assert_eq!(composite(&stack), before);
}

#[test]
fn same_kind_records_inside_the_interval_undo_as_one() {
    let mut stack = LayerStack::with_background(4, 4, RED).unwrap();
    let id = stack.active_layer_id();
    let mut h = UndoHistory::new(50, Duration::from_millis(500));
    let t0 = Instant::now();

    for (i, opacity) in [0.8, 0.6, 0.4, 0.2].into_iter().enumerate() {
        let before = LayerProps::capture(stack.layer(id).unwrap());
        assert!(stack.set_opacity(id, opacity));
        let after = LayerProps::capture(stack.layer(id).unwrap());
        h.record_at(
            Box::new(LayerPropsCommand::new(OperationKind::Opacity, id, before, after)),
            t0 + Duration::from_millis(100 * i as u64),
        );
    }
    assert_eq!(h.undo_count(), 1);
    h.undo(&mut stack);
    assert_eq!(stack.layer(id).unwrap().opacity(), 1.0);
    assert!(!h.can_undo());
}

#[test]
fn undoing_a_delete_restores_the_layer_in_place() {
    let mut stack = LayerStack::new(16, 16).unwrap();
    let root = stack.root_id();
    let mut h = history(20);
    let g = layer_ops::insert_layer(&mut stack, &mut h, root, 0, Layer::new_group("g")).unwrap();
    layer_ops::insert_layer(&mut stack, &mut h, g, 0, Layer::new_filled("other", 3, 3, BLUE).unwrap()).unwrap();

    let tile = Layer::new_filled("tile", 10, 10, RED)
        .unwrap()
        .with_transform(LayerTransform::new(Point::ZERO, Point::new(2.0, 1.0), 0.0, Point::ZERO).unwrap());
    let id = layer_ops::insert_layer(&mut stack, &mut h, g, 0, tile).unwrap();

    let tree = stack.describe_tree();
    let pixels = stack.layer(id).unwrap().pixels().unwrap().to_rgba_image();
    let image = composite(&stack);

    layer_ops::delete_layer(&mut stack, &mut h, id).unwrap();
    assert!(!stack.contains(id));
    assert_eq!(h.undo(&mut stack).as_deref(), Some("Delete Layer"));

    assert_eq!(stack.describe_tree(), tree);
    assert_eq!(stack.path_of(id), Some(vec![0, 0]));
    assert_eq!(stack.layer(id).unwrap().pixels().unwrap().to_rgba_image(), pixels);
    assert_eq!(composite(&stack), image);
}

#[test]
fn moving_a_group_into_its_descendant_is_a_cycle() {
    let mut stack = LayerStack::new(8, 8).unwrap();
    let root = stack.root_id();
    let outer = stack.insert_layer(root, 0, Layer::new_group("outer")).unwrap();
    let inner = stack.insert_layer(outer, 0, Layer::new_group("inner")).unwrap();
    stack.insert_layer(inner, 0, Layer::new_filled("x", 2, 2, RED).unwrap()).unwrap();

    let mut h = history(10);
    let tree = stack.describe_tree();
    let err = layer_ops::move_layer(&mut stack, &mut h, outer, inner, 0).unwrap_err();
    assert!(matches!(err, CoreError::Cycle { .. }));
    assert_eq!(stack.describe_tree(), tree);
    assert!(!h.can_undo());
}

#[test]
fn isolated_group_opacity_blends_with_the_backdrop() {
    let mut stack = LayerStack::with_background(2, 2, BLUE).unwrap();
    let root = stack.root_id();
    let g = stack.insert_layer(root, 1, Layer::new_group("g").with_isolate(true)).unwrap();
    stack.insert_layer(g, 0, Layer::new_filled("red", 2, 2, RED).unwrap()).unwrap();
    assert!(stack.set_opacity(g, 0.5));
    assert!(stack.set_blend_mode(g, BlendMode::Normal));

    let out = composite(&stack);
    for p in out.pixels() {
        assert_eq!(*p, Rgba([128, 0, 128, 255]));
    }
}

#[test]
fn merging_onto_a_locked_layer_fails() {
    let mut stack = LayerStack::with_background(4, 4, BLUE).unwrap();
    let root = stack.root_id();
    let lower = stack.active_layer_id();
    let upper = stack.insert_layer(root, 1, Layer::new_filled("up", 4, 4, RED).unwrap()).unwrap();
    let mut h = history(10);
    layer_ops::set_locked(&mut stack, &mut h, lower, true);

    let count = stack.layer_count();
    let err = layer_ops::merge_down(&mut stack, &mut h, upper).unwrap_err();
    assert!(matches!(err, CoreError::Merge { .. }));
    assert_eq!(stack.layer_count(), count);
}

#[test]
fn history_keeps_only_the_newest_steps() {
    let mut stack = LayerStack::new(8, 8).unwrap();
    let mut h = history(5);
    for _ in 0..6 {
        layer_ops::add_layer(&mut stack, &mut h).unwrap();
    }
    assert_eq!(h.undo_count(), 5);
    assert_eq!(h.undo_to(10, &mut stack), 5);
    // The first insertion fell off the end.
    assert_eq!(stack.layer_count(), 1);
}

#[test]
fn project_file_round_trip_keeps_the_composite() {
    let mut stack = LayerStack::with_background(40, 30, Rgba([250, 250, 250, 255])).unwrap();
    let root = stack.root_id();
    let mut h = history(10);
    let g = layer_ops::add_group(&mut stack, &mut h).unwrap();
    let rotated = Layer::new_filled("rot", 12, 8, Rgba([30, 160, 220, 200]))
        .unwrap()
        .with_position(10, 6)
        .with_transform(LayerTransform::new(Point::new(1.5, 0.0), Point::new(1.0, 1.5), 20.0, Point::new(6.0, 4.0)).unwrap());
    layer_ops::insert_layer(&mut stack, &mut h, g, 0, rotated).unwrap();
    let screen = layer_ops::insert_layer(&mut stack, &mut h, root, 2, Layer::new_filled("s", 40, 10, RED).unwrap()).unwrap();
    layer_ops::set_blend_mode(&mut stack, &mut h, screen, BlendMode::Screen);
    layer_ops::set_opacity(&mut stack, &mut h, g, 0.7);

    let loaded = decode_pfs(&encode_pfs(&stack).unwrap()).unwrap();
    assert_eq!(composite(&loaded), composite(&stack));
    assert_eq!(loaded.layer_count(), stack.layer_count());
}
