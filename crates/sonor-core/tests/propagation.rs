//! End-to-end propagation scenarios

use std::sync::Arc;

use sonor_core::config::EngineConfig;
use sonor_core::geometry::Coord;
use sonor_core::pathfinder::PathFinder;
use sonor_core::scene::{Geometry, SceneBuilder};
use sonor_core::scheduler::CancellationToken;
use sonor_core::sink::MemorySink;

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Coord> {
    vec![
        Coord::flat(x0, y0),
        Coord::flat(x1, y0),
        Coord::flat(x1, y1),
        Coord::flat(x0, y1),
    ]
}

fn flat_terrain(builder: &mut SceneBuilder, extent: f64) {
    for (x, y) in [
        (-extent, -extent),
        (extent, -extent),
        (extent, extent),
        (-extent, extent),
    ] {
        builder.add_topographic_point(Coord::new(x, y, 0.0));
    }
}

/// One 10 m building with a 20x10 m footprint between a source at
/// (0,0,1) and a receiver at (50,0,2) on flat terrain, reflections off,
/// diffraction on: at least one vertical diffraction path, no free field
/// path.
#[test]
fn scenario_single_building_blocks_sight_line() {
    let mut builder = SceneBuilder::new();
    flat_terrain(&mut builder, 200.0);
    builder
        .add_building(square(15.0, -5.0, 35.0, 5.0), 10.0, vec![0.1; 8])
        .unwrap();
    let scene = builder.finish().unwrap();

    let mut config = EngineConfig::default();
    config.reflection_order = 0;
    config.vertical_diffraction = true;
    config.horizontal_diffraction = true;
    let finder = PathFinder::new(Arc::new(scene), config);

    let src = Coord::new(0.0, 0.0, 1.0);
    let rcv = Coord::new(50.0, 0.0, 2.0);
    let paths = finder.direct_path(&src, None, &rcv, true, true);

    assert!(!paths.is_empty());
    assert!(
        paths.iter().any(|p| !p.vertical_diffraction.is_empty()),
        "expected a vertical diffraction path over the roof"
    );
    assert!(
        paths.iter().all(|p| !p.is_direct()),
        "a blocked pair must not produce a free field path"
    );
}

#[test]
fn whole_run_finalizes_every_receiver_once() {
    let mut builder = SceneBuilder::new();
    flat_terrain(&mut builder, 500.0);
    let mut powers = Vec::new();
    for i in 0..3 {
        builder
            .add_source(
                Geometry::Point(Coord::new(i as f64 * 40.0, 30.0, 0.5)),
                vec![95.0; 8],
                None,
            )
            .unwrap();
        powers.push(vec![95.0; 8]);
    }
    for i in 0..10 {
        builder.add_receiver(Coord::new(i as f64 * 15.0, -20.0, 1.5));
    }
    let scene = builder.finish().unwrap();

    let mut config = EngineConfig::default();
    config.thread_count = 3;
    config.maximum_error_db = 0.0;
    let finder = PathFinder::new(Arc::new(scene), config);
    let sink = Arc::new(MemorySink::new(powers));
    finder.run(sink.clone(), &CancellationToken::new());

    for receiver_id in 0..10 {
        assert_eq!(
            sink.finalize_count(receiver_id),
            1,
            "receiver {receiver_id} must be finalized exactly once"
        );
        assert_eq!(sink.visited_sources(receiver_id), 3);
        let level = sink.receiver_level(receiver_id).unwrap();
        assert!(level.iter().all(|l| l.is_finite() && *l > 0.0));
    }
}

/// Loosening the error tolerance may only skip sources whose contribution
/// stays under that tolerance: the result never grows and never falls
/// more than the tolerance below the exact run.
#[test]
fn early_exit_is_bounded_by_tolerance() {
    let tolerance = 3.0;
    let build = || {
        let mut builder = SceneBuilder::new();
        let mut powers = Vec::new();
        for x in [10.0, 40.0, 150.0, 400.0, 900.0] {
            builder
                .add_source(
                    Geometry::Point(Coord::new(x, 5.0, 0.5)),
                    vec![100.0; 8],
                    None,
                )
                .unwrap();
            powers.push(vec![100.0; 8]);
        }
        builder.add_receiver(Coord::new(0.0, 0.0, 1.5));
        (builder.finish().unwrap(), powers)
    };

    let (scene, powers) = build();
    let mut exact_config = EngineConfig::default();
    exact_config.maximum_error_db = 0.0;
    exact_config.reflection_order = 0;
    exact_config.thread_count = 1;
    let exact_sink = Arc::new(MemorySink::new(powers.clone()));
    PathFinder::new(Arc::new(scene), exact_config.clone())
        .run(exact_sink.clone(), &CancellationToken::new());

    let (scene, powers) = build();
    let mut loose_config = exact_config;
    loose_config.maximum_error_db = tolerance;
    let loose_sink = Arc::new(MemorySink::new(powers));
    PathFinder::new(Arc::new(scene), loose_config)
        .run(loose_sink.clone(), &CancellationToken::new());

    let exact = exact_sink.receiver_level(0).unwrap();
    let loose = loose_sink.receiver_level(0).unwrap();
    assert_eq!(exact_sink.visited_sources(0), 5);
    assert!(loose_sink.visited_sources(0) <= 5);
    for (e, l) in exact.iter().zip(loose.iter()) {
        assert!(*l <= e + 1e-9, "skipping sources must never add power");
        assert!(
            e - l <= tolerance,
            "early exit dropped more than the tolerance: exact {e} vs loose {l}"
        );
    }
}

#[test]
fn cancelled_token_stops_the_run_before_work() {
    let mut builder = SceneBuilder::new();
    builder
        .add_source(
            Geometry::Point(Coord::new(10.0, 0.0, 0.5)),
            vec![95.0; 8],
            None,
        )
        .unwrap();
    for i in 0..4 {
        builder.add_receiver(Coord::new(i as f64 * 5.0, -10.0, 1.5));
    }
    let scene = builder.finish().unwrap();
    let finder = PathFinder::new(Arc::new(scene), EngineConfig::default());
    let sink = Arc::new(MemorySink::new(vec![vec![95.0; 8]]));
    let token = CancellationToken::new();
    token.cancel();
    finder.run(sink.clone(), &token);
    for receiver_id in 0..4 {
        assert_eq!(sink.finalize_count(receiver_id), 0);
    }
}

/// Walls participate end to end: a receiver behind a wall still gets a
/// level through diffraction, and enabling reflections on an open pair
/// adds a reflected path's power.
#[test]
fn reflections_increase_received_power() {
    let build = |order: usize| {
        let mut builder = SceneBuilder::new();
        builder
            .add_wall(
                vec![Coord::new(10.0, -15.0, 0.0), Coord::new(10.0, 15.0, 0.0)],
                8.0,
                vec![0.2; 8],
            )
            .unwrap();
        builder
            .add_source(
                Geometry::Point(Coord::new(0.0, -3.0, 1.0)),
                vec![95.0; 8],
                None,
            )
            .unwrap();
        builder.add_receiver(Coord::new(0.0, 3.0, 1.0));
        let scene = builder.finish().unwrap();
        let mut config = EngineConfig::default();
        config.reflection_order = order;
        config.thread_count = 1;
        config.maximum_error_db = 0.0;
        let sink = Arc::new(MemorySink::new(vec![vec![95.0; 8]]));
        PathFinder::new(Arc::new(scene), config).run(sink.clone(), &CancellationToken::new());
        sink
    };
    let without = build(0).receiver_level(0).unwrap();
    let with = build(1).receiver_level(0).unwrap();
    assert!(
        with[0] > without[0],
        "a reflected path must add power: {} vs {}",
        with[0],
        without[0]
    );
}
