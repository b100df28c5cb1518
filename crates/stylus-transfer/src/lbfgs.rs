// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Limited-Memory BFGS
// ─────────────────────────────────────────────────────────────────────
//! Quasi-Newton minimiser over a flat parameter slice.
//!
//! One `step` runs up to `max_iter` inner iterations, each consisting of
//! a two-loop-recursion direction and a step length from the configured
//! line search. The evaluation closure may rewrite the parameters before
//! evaluating (the transfer loop clamps pixels there), so the reported
//! loss and gradient always describe the parameters as the closure left
//! them. Curvature history survives across `step` calls.

use std::collections::VecDeque;

use stylus_types::{LbfgsConfig, LineSearch, StyleResult};

/// Result of one closure call: loss, gradient, and caller data.
#[derive(Debug, Clone)]
pub struct Evaluation<T> {
    pub loss: f64,
    pub grad: Vec<f64>,
    pub info: T,
}

/// What a single `step` did.
#[derive(Debug, Clone)]
pub struct StepReport<T> {
    /// Loss at the first evaluation of the step.
    pub loss: f64,
    /// Loss at the parameters the step left behind.
    pub final_loss: f64,
    /// Caller data of every evaluation, in call order.
    pub evaluations: Vec<T>,
    /// Inner iterations performed.
    pub iterations: usize,
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
fn max_abs(a: &[f64]) -> f64 {
    a.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

/// y += alpha · x
#[inline]
fn axpy(y: &mut [f64], alpha: f64, x: &[f64]) {
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

struct LineSearchOutcome {
    t: f64,
    loss: f64,
    grad: Vec<f64>,
    evals: usize,
}

/// Armijo backtracking from `t0`, halving on failure.
///
/// When no trial satisfies the sufficient-decrease condition the best
/// trial below `loss0` is kept; failing that, `x` is restored and the
/// step length is zero.
#[allow(clippy::too_many_arguments)]
fn backtracking<T, F>(
    closure: &mut F,
    x: &mut [f64],
    d: &[f64],
    t0: f64,
    loss0: f64,
    grad0: &[f64],
    gtd: f64,
    cfg: &LbfgsConfig,
    infos: &mut Vec<T>,
) -> StyleResult<LineSearchOutcome>
where
    F: FnMut(&mut [f64]) -> StyleResult<Evaluation<T>>,
{
    let x0 = x.to_vec();
    let mut t = t0;
    let mut evals = 0;
    let mut best: Option<(f64, f64, Vec<f64>, Vec<f64>)> = None;

    for _ in 0..cfg.max_line_search {
        x.copy_from_slice(&x0);
        axpy(x, t, d);
        let eval = closure(x)?;
        evals += 1;
        infos.push(eval.info);

        if eval.loss <= loss0 + cfg.armijo_c1 * t * gtd {
            return Ok(LineSearchOutcome {
                t,
                loss: eval.loss,
                grad: eval.grad,
                evals,
            });
        }
        let improves = eval.loss < loss0 && best.as_ref().map_or(true, |b| eval.loss < b.1);
        if improves {
            best = Some((t, eval.loss, eval.grad, x.to_vec()));
        }
        t *= 0.5;
    }

    match best {
        Some((t, loss, grad, xb)) => {
            x.copy_from_slice(&xb);
            Ok(LineSearchOutcome {
                t,
                loss,
                grad,
                evals,
            })
        }
        None => {
            x.copy_from_slice(&x0);
            Ok(LineSearchOutcome {
                t: 0.0,
                loss: loss0,
                grad: grad0.to_vec(),
                evals,
            })
        }
    }
}

/// L-BFGS state.
#[derive(Debug, Clone)]
pub struct Lbfgs {
    cfg: LbfgsConfig,
    direction: Vec<f64>,
    step_len: f64,
    old_dirs: VecDeque<Vec<f64>>,
    old_steps: VecDeque<Vec<f64>>,
    rho: VecDeque<f64>,
    h_diag: f64,
    prev_grad: Vec<f64>,
    n_iter: usize,
    func_evals: usize,
}

impl Lbfgs {
    pub fn new(cfg: LbfgsConfig) -> StyleResult<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            direction: Vec::new(),
            step_len: 0.0,
            old_dirs: VecDeque::new(),
            old_steps: VecDeque::new(),
            rho: VecDeque::new(),
            h_diag: 1.0,
            prev_grad: Vec::new(),
            n_iter: 0,
            func_evals: 0,
        })
    }

    /// Inner iterations performed over the optimizer's lifetime.
    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    /// Closure evaluations performed over the optimizer's lifetime.
    pub fn func_evals(&self) -> usize {
        self.func_evals
    }

    /// Curvature pairs currently held.
    pub fn history_len(&self) -> usize {
        self.old_dirs.len()
    }

    /// Fold the last accepted step into the curvature history.
    fn update_curvature(&mut self, grad: &[f64]) {
        let y: Vec<f64> = grad
            .iter()
            .zip(self.prev_grad.iter())
            .map(|(g, p)| g - p)
            .collect();
        let s: Vec<f64> = self.direction.iter().map(|d| d * self.step_len).collect();
        let ys = dot(&y, &s);
        if ys > 1e-10 {
            if self.old_dirs.len() == self.cfg.history_size {
                self.old_dirs.pop_front();
                self.old_steps.pop_front();
                self.rho.pop_front();
            }
            self.h_diag = ys / dot(&y, &y);
            self.old_dirs.push_back(y);
            self.old_steps.push_back(s);
            self.rho.push_back(1.0 / ys);
        }
    }

    /// Two-loop recursion: approximate -H·g.
    fn two_loop(&self, grad: &[f64]) -> Vec<f64> {
        let k = self.old_dirs.len();
        let mut q: Vec<f64> = grad.iter().map(|g| -g).collect();
        let mut alpha = vec![0.0; k];
        for i in (0..k).rev() {
            alpha[i] = dot(&self.old_steps[i], &q) * self.rho[i];
            axpy(&mut q, -alpha[i], &self.old_dirs[i]);
        }
        for v in q.iter_mut() {
            *v *= self.h_diag;
        }
        for i in 0..k {
            let beta = dot(&self.old_dirs[i], &q) * self.rho[i];
            axpy(&mut q, alpha[i] - beta, &self.old_steps[i]);
        }
        q
    }

    /// Run one optimizer step, evaluating through `closure`.
    pub fn step<T, F>(&mut self, x: &mut [f64], mut closure: F) -> StyleResult<StepReport<T>>
    where
        F: FnMut(&mut [f64]) -> StyleResult<Evaluation<T>>,
    {
        let mut infos = Vec::new();
        let first = closure(x)?;
        infos.push(first.info);
        let orig_loss = first.loss;
        let mut loss = first.loss;
        let mut grad = first.grad;
        let mut current_evals = 1;
        self.func_evals += 1;

        if max_abs(&grad) <= self.cfg.tolerance_grad {
            return Ok(StepReport {
                loss: orig_loss,
                final_loss: loss,
                evaluations: infos,
                iterations: 0,
            });
        }

        let mut iterations = 0;
        loop {
            iterations += 1;
            self.n_iter += 1;

            if self.n_iter == 1 {
                self.direction = grad.iter().map(|g| -g).collect();
                self.old_dirs.clear();
                self.old_steps.clear();
                self.rho.clear();
                self.h_diag = 1.0;
            } else {
                self.update_curvature(&grad);
                self.direction = self.two_loop(&grad);
            }
            self.prev_grad.clone_from(&grad);
            let prev_loss = loss;

            self.step_len = if self.n_iter == 1 {
                let g_sum: f64 = grad.iter().map(|g| g.abs()).sum();
                (1.0 / g_sum).min(1.0) * self.cfg.lr
            } else {
                self.cfg.lr
            };

            let gtd = dot(&grad, &self.direction);
            if gtd > -self.cfg.tolerance_change {
                break;
            }

            let ls_evals = match self.cfg.line_search {
                LineSearch::Backtracking => {
                    let out = backtracking(
                        &mut closure,
                        x,
                        &self.direction,
                        self.step_len,
                        loss,
                        &grad,
                        gtd,
                        &self.cfg,
                        &mut infos,
                    )?;
                    self.step_len = out.t;
                    loss = out.loss;
                    grad = out.grad;
                    out.evals
                }
                LineSearch::None => {
                    axpy(x, self.step_len, &self.direction);
                    if iterations != self.cfg.max_iter {
                        let eval = closure(x)?;
                        infos.push(eval.info);
                        loss = eval.loss;
                        grad = eval.grad;
                        1
                    } else {
                        0
                    }
                }
            };
            current_evals += ls_evals;
            self.func_evals += ls_evals;

            if iterations == self.cfg.max_iter || current_evals >= self.cfg.max_eval {
                break;
            }
            if max_abs(&grad) <= self.cfg.tolerance_grad {
                break;
            }
            if max_abs(&self.direction) * self.step_len.abs() <= self.cfg.tolerance_change {
                break;
            }
            if (loss - prev_loss).abs() < self.cfg.tolerance_change {
                break;
            }
        }

        Ok(StepReport {
            loss: orig_loss,
            final_loss: loss,
            evaluations: infos,
            iterations,
        })
    }
}
