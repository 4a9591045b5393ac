//! Cross-backend properties of the k-NN machinery and the LOF scenarios
//! the service contract is calibrated against.

use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sod::distance::euclidean;
use sod::knn::{Algorithm, Brute, DataPoint, GreenBlueKd, KnnIndex, KnnSearcher};
use sod::lof::{LofConfig, LofPredictor};
use sod::{Distance, Error, Point};

fn dp(components: Vec<f64>, secs: i64) -> DataPoint {
    DataPoint::new(Point::new(components), Utc.timestamp_opt(secs, 0).unwrap())
}

fn random_points(rng: &mut StdRng, n: usize, dims: usize) -> Vec<DataPoint> {
    (0..n)
        .map(|i| {
            let components: Vec<f64> = (0..dims).map(|_| rng.gen_range(-50.0..50.0)).collect();
            dp(components, i as i64)
        })
        .collect()
}

#[test]
fn kd_tree_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..10 {
        let points = random_points(&mut rng, 300, 3);
        let kd = GreenBlueKd::new(euclidean);
        let brute = Brute::new(euclidean);
        kd.build(points.clone());
        brute.build(points);

        for _ in 0..20 {
            let query = Point::new(vec![
                rng.gen_range(-60.0..60.0),
                rng.gen_range(-60.0..60.0),
                rng.gen_range(-60.0..60.0),
            ]);
            let k = rng.gen_range(1..10);
            let from_kd = kd.searcher().knn(&query, k).unwrap();
            let from_brute = brute.searcher().knn(&query, k).unwrap();

            let dists = |set: &[Point]| -> Vec<f64> {
                set.iter()
                    .map(|p| euclidean(query.as_slice(), p.as_slice()).unwrap())
                    .collect()
            };
            let kd_dists = dists(&from_kd);
            let brute_dists = dists(&from_brute);
            for (a, b) in kd_dists.iter().zip(brute_dists.iter()) {
                assert!(
                    (a - b).abs() < 1e-9,
                    "kd and brute disagree: {:?} vs {:?}",
                    kd_dists,
                    brute_dists
                );
            }
        }
    }
}

#[test]
fn knn_with_appends_stays_exact() {
    let mut rng = StdRng::seed_from_u64(11);
    let initial = random_points(&mut rng, 100, 2);
    let kd = GreenBlueKd::new(euclidean);
    let brute = Brute::new(euclidean);
    kd.build(initial.clone());
    brute.build(initial);

    for i in 0..100 {
        let point = dp(
            vec![rng.gen_range(-50.0..50.0), rng.gen_range(-50.0..50.0)],
            1_000 + i,
        );
        kd.append(point.clone());
        brute.append(point);
    }

    let query = Point::new(vec![0.0, 0.0]);
    let kd_best = kd.searcher().knn(&query, 5).unwrap();
    let brute_best = brute.searcher().knn(&query, 5).unwrap();
    for (a, b) in kd_best.iter().zip(brute_best.iter()) {
        let da = euclidean(query.as_slice(), a.as_slice()).unwrap();
        let db = euclidean(query.as_slice(), b.as_slice()).unwrap();
        assert!((da - db).abs() < 1e-9);
    }
}

#[test]
fn rebuild_observes_exactly_the_time_tree() {
    let kd = GreenBlueKd::new(euclidean);
    kd.build((0..50).map(|i| dp(vec![i as f64, 0.0], i)).collect());

    // Tombstone the first thirty, then rebuild: the index must forget them.
    kd.remove_older_than(Utc.timestamp_opt(29, 0).unwrap());
    kd.rebuild();

    assert_eq!(kd.len(), 20);
    let nearest = kd
        .searcher()
        .knn(&Point::new(vec![0.0, 0.0]), 1)
        .unwrap();
    assert_eq!(nearest[0], Point::new(vec![30.0, 0.0]));
}

#[test]
fn lof_cluster_scenario() {
    // The canonical service scenario: five clustered points, a sixth
    // nearby point is an inlier, a distant point is an outlier.
    for algorithm in [Algorithm::Brute, Algorithm::KdTree] {
        let predictor = LofPredictor::new(LofConfig {
            k: 3,
            skip_items: 5,
            distance: Distance::Euclidean,
            algorithm,
        })
        .unwrap();

        let warmup = [
            [1.0, 1.0],
            [1.0, 2.0],
            [2.0, 1.0],
            [2.0, 2.0],
            [1.5, 1.5],
        ];
        for (i, vec) in warmup.iter().enumerate() {
            predictor.append(dp(vec.to_vec(), i as i64));
        }

        let inlier = predictor.predict(&Point::new(vec![1.6, 1.4])).unwrap();
        assert!(!inlier.outlier, "{algorithm:?}: [1.6,1.4] must be an inlier");
        predictor.append(dp(vec![1.6, 1.4], 5));

        let outlier = predictor.predict(&Point::new(vec![100.0, 100.0])).unwrap();
        assert!(outlier.outlier, "{algorithm:?}: [100,100] must be an outlier");
    }
}

#[test]
fn warmup_points_are_never_scored() {
    let predictor = LofPredictor::new(LofConfig {
        skip_items: 5,
        ..LofConfig::default()
    })
    .unwrap();

    for i in 0..4 {
        predictor.append(dp(vec![i as f64, i as f64], i as i64));
        let err = predictor
            .predict(&Point::new(vec![0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }
}

#[test]
fn distance_metrics_agree_on_identity_and_symmetry() {
    let mut rng = StdRng::seed_from_u64(3);
    for metric in [Distance::Euclidean, Distance::Manhattan, Distance::Chebyshev] {
        for _ in 0..50 {
            let a: Vec<f64> = (0..4).map(|_| rng.gen_range(-10.0..10.0)).collect();
            let b: Vec<f64> = (0..4).map(|_| rng.gen_range(-10.0..10.0)).collect();
            assert_eq!(metric.compute(&a, &a).unwrap(), 0.0);
            let ab = metric.compute(&a, &b).unwrap();
            assert!(ab >= 0.0);
            assert_eq!(ab, metric.compute(&b, &a).unwrap());
        }
    }
}
