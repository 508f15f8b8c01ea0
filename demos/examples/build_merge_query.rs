// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Partitioned build on disk: four subsets, a merge, then LOD queries.
//!
//! Each subset is built by its own `Builder` as if on a separate machine, saved
//! under the same path, then folded into one whole index by a `Merger`.
//!
//! Run:
//! - `cargo run -p understory_cloud_demos --example build_merge_query`

use std::sync::Arc;

use understory_cloud::{
    Bounds, DimInfo, DimType, FileStorage, Index, ORIGIN_DIM, Point, PointBuffer, Schema,
    Structure, Subset, Value,
};
use understory_cloud_build::{BuildConfig, Builder, Merger, OuterScope};

/// A hill: dense near the middle, with heights that rise towards it.
fn terrain(schema: &Arc<Schema>, count: u32) -> PointBuffer {
    let mut points = PointBuffer::new(schema.clone());
    for i in 0..count {
        let t = f64::from(i) * 0.618_033_988_75;
        let r = 500.0 * (f64::from(i) / f64::from(count)).sqrt();
        let x = 500.0 + r * (t * std::f64::consts::TAU).cos();
        let y = 500.0 + r * (t * std::f64::consts::TAU).sin();
        let z = 100.0 - r / 5.0;
        points.push(&[x, y, z, f64::from(i % 4096), 0.0]);
    }
    points
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let storage = Arc::new(FileStorage::new(dir.path()));
    let scope = OuterScope::new(storage.clone());
    let schema = Arc::new(Schema::xyz([
        DimInfo::new("Intensity", DimType::Uint16),
        DimInfo::new(ORIGIN_DIM, DimType::Uint32),
    ]));
    let bounds = Bounds::new(Point::new(0.0, 0.0, 0.0), Point::new(1000.0, 1000.0, 100.0));
    let structure = Structure::new(4, 7, 14)?;
    let points = terrain(&schema, 200_000);

    for id in 0..4 {
        let builder = Builder::new(
            &scope,
            "terrain",
            bounds,
            schema.clone(),
            structure,
            Some(Subset::new(id, 4)?),
            BuildConfig {
                max_live_chunks: Some(64),
                ..BuildConfig::default()
            },
        )?;
        let stats = builder.insert(&mut points.clone(), 1)?;
        tracing::info!(
            subset = id,
            inserted = stats.inserted,
            tossed = stats.tossed,
            elsewhere = stats.out_of_bounds,
            "Built subset"
        );
        builder.save()?;
    }

    let whole = Merger::new("terrain", 4, None, storage.clone())?.go()?;
    tracing::info!(
        points = whole.num_points(),
        tossed = whole.num_tossed(),
        "Merged"
    );

    let reopened = Index::open(storage, "terrain", None)?;
    for end in [2, 4, 6, 8] {
        println!(
            "depths 0..{end}: {} points",
            reopened.query(0, end)?.len()
        );
    }

    let window = Bounds::new_2d(450.0, 450.0, 550.0, 550.0);
    let near = reopened.query_bounds(&window, 0, 15)?;
    println!("{} points in the central window", near.len());

    let wanted = Schema::new(vec![
        DimInfo::new("Z", DimType::Float32),
        DimInfo::new("Intensity", DimType::Uint16),
        DimInfo::new(ORIGIN_DIM, DimType::Uint32),
    ]);
    if let Some(first) = near.first() {
        let bytes = reopened.fetch_point_data(first, &wanted)?;
        let read = |name: &str| wanted.find(name).map(|slot| slot.read(&bytes));
        if let (Some(Value::Float(z)), Some(intensity)) = (read("Z"), read("Intensity")) {
            println!(
                "{first}: z = {z:.2}, intensity = {}",
                intensity.as_f64()
            );
        }
    }
    Ok(())
}
