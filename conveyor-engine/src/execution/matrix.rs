// Matrix Strategy Expansion
// Expands matrix strategies into concrete job instances

use crate::error::{EngineError, EngineResult};
use crate::execution::graph::{GraphError, GraphNode};
use crate::value::Value;
use crate::workflow::models::{JobSpec, Matrix, WorkflowSpec};

use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A single matrix combination, axis name -> value in axis order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixCombination {
    pub values: IndexMap<String, Value>,
}

impl MatrixCombination {
    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.values.get(axis)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Instance id suffix: values joined with '-' in axis order
    pub fn suffix(&self) -> String {
        self.values
            .values()
            .map(|v| v.as_string())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Human readable label, e.g. `(linux, 18)`
    pub fn label(&self) -> String {
        let values: Vec<String> = self.values.values().map(|v| v.as_string()).collect();
        format!("({})", values.join(", "))
    }

    fn matches(&self, tuple: &BTreeMap<String, Value>) -> bool {
        tuple
            .iter()
            .all(|(axis, value)| self.values.get(axis) == Some(value))
    }
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Cartesian product of the axes, last axis fastest, minus excluded
    /// combinations. Any empty axis yields no combinations.
    pub fn expand(matrix: &Matrix) -> Vec<MatrixCombination> {
        if matrix.axes.values().any(|values| values.is_empty()) {
            return Vec::new();
        }

        let axes: Vec<(&String, &Vec<Value>)> = matrix.axes.iter().collect();
        let total: usize = axes.iter().map(|(_, values)| values.len()).product();
        let mut combinations = Vec::with_capacity(total);
        let mut indices = vec![0usize; axes.len()];

        for _ in 0..total {
            let combination = MatrixCombination {
                values: axes
                    .iter()
                    .zip(&indices)
                    .map(|((name, values), &i)| ((*name).clone(), values[i].clone()))
                    .collect(),
            };

            if !matrix.exclude.iter().any(|tuple| combination.matches(tuple)) {
                combinations.push(combination);
            }

            // Odometer increment, last axis fastest
            for pos in (0..indices.len()).rev() {
                indices[pos] += 1;
                if indices[pos] < axes[pos].1.len() {
                    break;
                }
                indices[pos] = 0;
            }
        }

        combinations
    }

    /// Check a matrix for configuration errors
    pub fn validate(matrix: &Matrix) -> Result<(), String> {
        if matrix.axes.contains_key("include") {
            return Err("matrix 'include' is not supported".to_string());
        }

        for tuple in &matrix.exclude {
            if tuple.is_empty() {
                return Err("empty exclude entry would remove every combination".to_string());
            }
            if let Some(axis) = tuple.keys().find(|axis| !matrix.axes.contains_key(*axis)) {
                return Err(format!("exclude names unknown matrix axis '{}'", axis));
            }
        }

        Ok(())
    }
}

/// A job bound to one matrix combination, or the job itself
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// `job` or `job-v1-v2`
    pub id: String,
    pub job: Arc<JobSpec>,
    pub matrix: MatrixCombination,
    /// Resolved dependencies (instance ids)
    pub needs: Vec<String>,
    /// Each `needs` entry as written, with the instances it stands for
    pub need_groups: Vec<(String, Vec<String>)>,
    /// The job has a matrix with no combinations left; it is reported as skipped
    pub empty_matrix: bool,
}

impl JobInstance {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn display_name(&self) -> String {
        if self.matrix.is_empty() {
            self.job.display_name().to_string()
        } else {
            format!("{} {}", self.job.display_name(), self.matrix.label())
        }
    }
}

impl GraphNode for JobInstance {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.needs
    }
}

/// Expand every job of a workflow into instances and resolve `needs`.
///
/// A `needs` entry naming a job stands for all of its instances; an entry
/// naming an instance id stands for that instance only. Two instances that
/// end up with the same id are a configuration error.
pub fn expand_jobs(workflow: &WorkflowSpec) -> EngineResult<Vec<JobInstance>> {
    let mut instances = Vec::new();
    let mut by_job: HashMap<&str, Vec<String>> = HashMap::new();
    let mut sources: HashMap<String, String> = HashMap::new();

    for (id, job) in &workflow.jobs {
        let job = Arc::new(JobSpec {
            id: id.clone(),
            ..job.clone()
        });
        let combinations = job.matrix().map(MatrixExpander::expand);

        let bound: Vec<(String, MatrixCombination, bool)> = match combinations {
            None => vec![(id.clone(), MatrixCombination::default(), false)],
            Some(combos) if combos.is_empty() => {
                vec![(id.clone(), MatrixCombination::default(), true)]
            }
            Some(combos) => combos
                .into_iter()
                .map(|combo| {
                    let instance_id = if combo.is_empty() {
                        id.clone()
                    } else {
                        format!("{}-{}", id, combo.suffix())
                    };
                    (instance_id, combo, false)
                })
                .collect(),
        };

        for (instance_id, matrix, empty_matrix) in bound {
            let source = instance_source(id, &matrix);
            if let Some(other) = sources.insert(instance_id.clone(), source.clone()) {
                return Err(EngineError::config(format!(
                    "instance id '{}' is produced by both {} and {}",
                    instance_id, other, source
                )));
            }
            by_job
                .entry(id.as_str())
                .or_default()
                .push(instance_id.clone());
            instances.push(JobInstance {
                id: instance_id,
                job: Arc::clone(&job),
                matrix,
                needs: Vec::new(),
                need_groups: Vec::new(),
                empty_matrix,
            });
        }
    }

    let instance_ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();

    for instance in &mut instances {
        let mut needs = Vec::new();
        let mut groups = Vec::new();

        for need in instance.job.needs.as_slice() {
            let resolved = if let Some(ids) = by_job.get(need.as_str()) {
                ids.clone()
            } else if instance_ids.contains(need) {
                vec![need.clone()]
            } else {
                return Err(GraphError::unknown_dependency(
                    format!(
                        "job '{}' needs unknown job or instance '{}'",
                        instance.job.id, need
                    ),
                    vec![instance.job.id.clone(), need.clone()],
                )
                .into());
            };

            for id in &resolved {
                if !needs.contains(id) {
                    needs.push(id.clone());
                }
            }
            groups.push((need.clone(), resolved));
        }

        instance.needs = needs;
        instance.need_groups = groups;
    }

    Ok(instances)
}

fn instance_source(job_id: &str, matrix: &MatrixCombination) -> String {
    if matrix.is_empty() {
        format!("job '{}'", job_id)
    } else {
        format!("job '{}' with matrix {}", job_id, matrix.label())
    }
}
