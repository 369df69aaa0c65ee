#![recursion_limit = "512"]

use burn::tensor::backend::Backend as BackendTrait;
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use burn_sequence_zoo::{wkv_sequence, wkv_step};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

type Backend = NdArray<f32>;

#[derive(Clone, Copy)]
struct KernelConfig {
    name: &'static str,
    batch: usize,
    time: usize,
    channels: usize,
    heads: usize,
}

const KERNEL_CONFIGS: &[KernelConfig] = &[
    KernelConfig {
        name: "b8_t64_c128",
        batch: 8,
        time: 64,
        channels: 128,
        heads: 2,
    },
    KernelConfig {
        name: "b8_t256_c128",
        batch: 8,
        time: 256,
        channels: 128,
        heads: 2,
    },
    KernelConfig {
        name: "b16_t64_c256",
        batch: 16,
        time: 64,
        channels: 256,
        heads: 4,
    },
];

fn wkv_bench(c: &mut Criterion) {
    <Backend as BackendTrait>::seed(42);
    let device = <Backend as BackendTrait>::Device::default();
    let normal = Distribution::Normal(0.0, 1.0);

    for cfg in KERNEL_CONFIGS {
        let head_dim = cfg.channels / cfg.heads;
        let shape = [cfg.batch, cfg.time, cfg.channels];
        let r = Tensor::<Backend, 3>::random(shape, normal, &device);
        let k = Tensor::<Backend, 3>::random(shape, normal, &device);
        let v = Tensor::<Backend, 3>::random(shape, normal, &device);
        let w = Tensor::<Backend, 3>::random(shape, normal, &device);
        let bonus = Tensor::<Backend, 2>::random([cfg.heads, head_dim], normal, &device);
        let state =
            Tensor::<Backend, 4>::zeros([cfg.batch, cfg.heads, head_dim, head_dim], &device);

        c.bench_with_input(BenchmarkId::new("wkv_sequence", cfg.name), cfg, |b, _| {
            b.iter(|| {
                let _ = wkv_sequence(
                    r.clone(),
                    k.clone(),
                    v.clone(),
                    w.clone(),
                    bonus.clone(),
                    state.clone(),
                    cfg.heads,
                )
                .expect("whole sequence");
            });
        });

        // Pre-sliced steps so the replay times the kernel, not the slicing.
        let slice = |x: &Tensor<Backend, 3>, t: usize| {
            x.clone().slice_dim(1, t..t + 1).squeeze::<2>(1)
        };
        let steps: Vec<_> = (0..cfg.time)
            .map(|t| (slice(&r, t), slice(&k, t), slice(&v, t), slice(&w, t)))
            .collect();

        c.bench_with_input(BenchmarkId::new("wkv_step_replay", cfg.name), cfg, |b, _| {
            b.iter(|| {
                let mut carried = state.clone();
                for (r_t, k_t, v_t, w_t) in &steps {
                    let (_, next) = wkv_step(
                        r_t.clone(),
                        k_t.clone(),
                        v_t.clone(),
                        w_t.clone(),
                        bonus.clone(),
                        carried,
                        cfg.heads,
                    )
                    .expect("single step");
                    carried = next;
                }
            });
        });
    }
}

criterion_group!(benches, wkv_bench);
criterion_main!(benches);
