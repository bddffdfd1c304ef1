use approx::assert_abs_diff_eq;
use lstm_seqpack::{Lstm, LstmConfig, LstmError, ParamKey, ParamName, SGD};
use ndarray::{arr2, Array2, ArrayD, ArrayViewMutD, Dimension};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sum_squared(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    (a - b).mapv(|d| d * d).sum()
}

fn grads(lstm: &Lstm) -> Vec<(ParamKey, ArrayD<f64>)> {
    lstm.walk()
        .flat_map(|node| {
            node.params().map(move |(name, param)| {
                (ParamKey { node: node.id(), param: name }, param.grad().clone())
            })
        })
        .collect()
}

#[test]
fn test_lstm_init_with_sizes() {
    for &(n_out, n_in) in &[(1, 2), (2, 2), (100, 200), (9, 6)] {
        let lstm = Lstm::new(n_out, n_in).unwrap();

        for node in lstm.walk() {
            // Cell nodes declare every parameter up front.
            if node.has_param(ParamName::W) {
                for name in ParamName::ALL {
                    assert!(node.has_param(name), "{} missing on {}", name, node.name());
                }
            }
        }
        for node in lstm.walk() {
            if node.has_param(ParamName::W) {
                assert_eq!(node.get_param(ParamName::W).unwrap().shape(), &[n_out * 4, n_out + n_in]);
            }
            if node.has_param(ParamName::B) {
                assert_eq!(node.get_param(ParamName::B).unwrap().shape(), &[n_out * 4]);
            }
            if node.has_param(ParamName::InitialHiddens) {
                assert_eq!(node.get_param(ParamName::InitialHiddens).unwrap().shape(), &[n_out]);
            }
            if node.has_param(ParamName::InitialCells) {
                assert_eq!(node.get_param(ParamName::InitialCells).unwrap().shape(), &[n_out]);
            }
        }
        assert_eq!(lstm.walk().filter(|node| node.has_param(ParamName::W)).count(), 1);
    }
}

#[test]
fn test_lstm_fwd_bwd_shapes() {
    init_logging();
    let mut lstm = Lstm::new(1, 2).unwrap();

    let x = arr2(&[[0.1, 0.1], [-0.1, -0.1], [1.0, 1.0]]);
    let (ys, backprop) = lstm.begin_update(&[x.clone()]).unwrap();
    assert_eq!(ys[0].shape(), &[3, 1]);

    let dxs = backprop.backprop(&mut lstm, &ys).unwrap();
    assert_eq!(dxs.len(), 1);
    assert_eq!(dxs[0].shape(), x.shape());
}

fn sgd(_key: ParamKey, mut weights: ArrayViewMutD<'_, f64>, mut gradient: ArrayViewMutD<'_, f64>) {
    weights.scaled_add(-0.001, &gradient);
    gradient.fill(0.0);
}

#[test]
fn test_lstm_learns() {
    init_logging();
    let mut lstm = Lstm::new(2, 2).unwrap();

    let x = arr2(&[[0.1, 0.1], [0.2, 0.2], [0.3, 0.3]]);
    let y = arr2(&[[0.2, 0.2], [0.3, 0.3], [0.4, 0.4]]);

    let (yhs, _) = lstm.begin_update(&[x.clone()]).unwrap();
    let loss1 = sum_squared(&yhs[0], &y);

    let (yhs, backprop) = lstm.begin_update(&[x.clone()]).unwrap();
    backprop.backprop(&mut lstm, &[&yhs[0] - &y]).unwrap();
    lstm.finish_update(sgd);

    let (yhs, backprop) = lstm.begin_update(&[x.clone()]).unwrap();
    backprop.backprop(&mut lstm, &[&yhs[0] - &y]).unwrap();
    let loss2 = sum_squared(&yhs[0], &y);

    assert!(loss1 > loss2, "{} vs {}", loss1, loss2);
}

#[test]
fn test_gradients_are_zero_after_finish_update() {
    let mut lstm = Lstm::from_config(LstmConfig::new(3, 2).with_depth(2).with_seed(1)).unwrap();
    let xs = vec![arr2(&[[0.3, -0.2], [0.1, 0.4]]), arr2(&[[1.0, 0.0]])];
    let (ys, backprop) = lstm.begin_update(&xs).unwrap();
    backprop.backprop(&mut lstm, &ys).unwrap();
    assert!(grads(&lstm).iter().any(|(_, g)| g.iter().any(|&v| v != 0.0)));

    // The callback leaves gradients alone; the layer still clears them.
    let mut visited = Vec::new();
    let drained = lstm.finish_update(|key, _, _| visited.push(key));
    assert_eq!(drained, 8);
    assert_eq!(visited.len(), 8);
    visited.dedup();
    assert_eq!(visited.len(), 8);

    for (key, grad) in grads(&lstm) {
        assert!(grad.iter().all(|&v| v == 0.0), "{} not cleared", key);
    }
}

#[test]
fn test_gradients_accumulate_across_updates() {
    let mut lstm = Lstm::from_config(LstmConfig::new(2, 3).with_seed(9)).unwrap();
    let xs = vec![arr2(&[[0.3, -0.2, 0.5], [0.1, 0.4, -0.3]])];

    let (ys, first) = lstm.begin_update(&xs).unwrap();
    let (_, second) = lstm.begin_update(&xs).unwrap();
    first.backprop(&mut lstm, &ys).unwrap();
    let once = grads(&lstm);
    second.backprop(&mut lstm, &ys).unwrap();
    let twice = grads(&lstm);

    for ((_, a), (_, b)) in once.iter().zip(&twice) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(2.0 * x, *y, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_outputs_do_not_depend_on_batch_mates() {
    let mut lstm = Lstm::from_config(LstmConfig::new(3, 2).with_depth(2).with_seed(4)).unwrap();
    let short = arr2(&[[0.5, -0.5], [0.2, 0.1]]);
    let long = arr2(&[[0.1, 0.0], [0.0, 0.3], [0.7, 0.7], [-0.2, 0.4]]);

    let (alone, bp_alone) = lstm.begin_update(&[short.clone()]).unwrap();
    let dx_alone = bp_alone.backprop(&mut lstm, &alone).unwrap();

    let (batched, bp_batched) = lstm
        .begin_update(&[short.clone(), long.clone(), Array2::zeros((0, 2))])
        .unwrap();
    let dx_batched = bp_batched.backprop(&mut lstm, &batched).unwrap();

    assert_eq!(batched[1].shape(), &[4, 3]);
    assert_eq!(batched[2].shape(), &[0, 3]);
    for (a, b) in alone[0].iter().zip(batched[0].iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
    for (a, b) in dx_alone[0].iter().zip(dx_batched[0].iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_backprop_matches_finite_differences() {
    for depth in [1, 2] {
        let config = LstmConfig::new(2, 3).with_depth(depth).with_init_scale(0.5).with_seed(21);
        let mut lstm = Lstm::from_config(config).unwrap();
        let xs = vec![
            arr2(&[[0.3, -0.2, 0.5], [0.1, 0.4, -0.3], [0.0, 0.2, 0.9]]),
            arr2(&[[-0.6, 0.1, 0.2]]),
        ];
        // L = Σ y ⊙ r, so dL/dy = r.
        let rs = vec![
            arr2(&[[0.5, -1.0], [0.3, 0.2], [-0.4, 0.8]]),
            arr2(&[[1.0, 0.7]]),
        ];
        let loss = |lstm: &Lstm, xs: &[Array2<f64>]| -> f64 {
            let ys = lstm.predict(xs).unwrap();
            ys.iter().zip(&rs).map(|(y, r)| (y * r).sum()).sum()
        };

        let (_, backprop) = lstm.begin_update(&xs).unwrap();
        let dxs = backprop.backprop(&mut lstm, &rs).unwrap();
        let analytic = grads(&lstm);
        lstm.finish_update(|_, _, _| {});

        let eps = 1e-5;
        for (key, grad) in &analytic {
            for (index, &expected) in grad.indexed_iter() {
                let index = index.slice().to_vec();
                let nudge = |lstm: &mut Lstm, delta: f64| {
                    lstm.finish_update(|k, mut value, _| {
                        if k == *key {
                            value[&index[..]] += delta;
                        }
                    });
                };
                nudge(&mut lstm, eps);
                let plus = loss(&lstm, &xs);
                nudge(&mut lstm, -2.0 * eps);
                let minus = loss(&lstm, &xs);
                nudge(&mut lstm, eps);

                let numeric = (plus - minus) / (2.0 * eps);
                assert_abs_diff_eq!(expected, numeric, epsilon = 1e-6);
            }
        }

        for (i, x) in xs.iter().enumerate() {
            for (index, &expected) in dxs[i].indexed_iter() {
                let mut plus = xs.clone();
                plus[i][index] += eps;
                let mut minus = xs.clone();
                minus[i][index] -= eps;
                let numeric = (loss(&lstm, &plus) - loss(&lstm, &minus)) / (2.0 * eps);
                assert_abs_diff_eq!(expected, numeric, epsilon = 1e-6);
            }
            assert_eq!(dxs[i].shape(), x.shape());
        }
    }
}

#[test]
fn test_finish_update_with_optimizer_moves_weights() {
    let mut lstm = Lstm::from_config(LstmConfig::new(2, 2).with_seed(2)).unwrap();
    let before: Vec<ArrayD<f64>> = lstm
        .walk()
        .filter_map(|node| node.get_param(ParamName::W).ok().cloned())
        .collect();

    let xs = vec![arr2(&[[0.5, 0.5], [0.1, -0.1]])];
    let (ys, backprop) = lstm.begin_update(&xs).unwrap();
    backprop.backprop(&mut lstm, &ys).unwrap();
    assert_eq!(lstm.finish_update_with(&mut SGD::new(0.1)), 4);

    let after: Vec<ArrayD<f64>> = lstm
        .walk()
        .filter_map(|node| node.get_param(ParamName::W).ok().cloned())
        .collect();
    assert_ne!(before, after);
}

#[test]
fn test_backprop_is_rejected_after_weights_change() {
    let mut lstm = Lstm::new(2, 2).unwrap();
    let xs = vec![arr2(&[[0.5, 0.5]])];
    let (ys, backprop) = lstm.begin_update(&xs).unwrap();
    lstm.finish_update_with(&mut SGD::new(0.1));
    assert_eq!(backprop.backprop(&mut lstm, &ys).unwrap_err(), LstmError::StaleTape);
}

#[test]
fn test_backprop_rejects_wrong_number_of_output_gradients() {
    let mut lstm = Lstm::from_config(LstmConfig::new(2, 2).with_seed(6)).unwrap();
    let xs = vec![arr2(&[[0.5, 0.5], [0.1, -0.1]]), arr2(&[[0.3, 0.2]])];
    let (ys, backprop) = lstm.begin_update(&xs).unwrap();

    let err = backprop.backprop(&mut lstm, &ys[..1]).unwrap_err();
    assert_eq!(err, LstmError::BatchSizeMismatch { expected: 2, got: 1 });
    for (key, grad) in grads(&lstm) {
        assert!(grad.iter().all(|&v| v == 0.0), "{} touched", key);
    }
}
