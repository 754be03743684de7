use serde_json::Value;

use super::{Entity, Simulation};

/// Cartesian-product generator of simulations over parameter axes
#[derive(Debug, Clone, Default)]
pub struct SweepBuilder {
    axes: Vec<(String, Vec<Value>)>,
}

impl SweepBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an axis; its values vary faster than those of earlier axes
    pub fn add_sweep_definition<I, V>(&mut self, parameter: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.axes
            .push((parameter.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Number of simulations `simulations` will produce
    pub fn count(&self) -> usize {
        if self.axes.is_empty() {
            return 0;
        }
        self.axes.iter().map(|(_, values)| values.len()).product()
    }

    /// One simulation per point of the product, each derived from `base`
    ///
    /// The swept values are written both as parameters and as tags.
    pub fn simulations(&self, base: &Simulation) -> Vec<Simulation> {
        let total = self.count();
        let mut generated = Vec::with_capacity(total);
        let mut cursor = vec![0usize; self.axes.len()];

        for _ in 0..total {
            let mut simulation = Simulation::from_template(base);
            for ((parameter, values), &index) in self.axes.iter().zip(&cursor) {
                let value = &values[index];
                simulation.set_tag(parameter.clone(), tag_value(value));
                simulation.set_parameter(parameter.clone(), value.clone());
            }
            generated.push(simulation);

            // Odometer increment, last axis fastest
            for (position, (_, values)) in self.axes.iter().enumerate().rev() {
                cursor[position] += 1;
                if cursor[position] < values.len() {
                    break;
                }
                cursor[position] = 0;
            }
        }

        generated
    }
}

fn tag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_product_order() {
        let mut sweep = SweepBuilder::new();
        sweep
            .add_sweep_definition("a", [1, 2])
            .add_sweep_definition("b", ["x", "y", "z"]);
        assert_eq!(sweep.count(), 6);

        let sims = sweep.simulations(&Simulation::named("base"));
        let points: Vec<(Value, Value)> = sims
            .iter()
            .map(|s| {
                (
                    s.get_parameter("a").cloned().unwrap(),
                    s.get_parameter("b").cloned().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            points,
            vec![
                (json!(1), json!("x")),
                (json!(1), json!("y")),
                (json!(1), json!("z")),
                (json!(2), json!("x")),
                (json!(2), json!("y")),
                (json!(2), json!("z")),
            ]
        );
        assert_eq!(sims[4].tags().get("b").map(String::as_str), Some("y"));
        assert_eq!(sims[4].tags().get("a").map(String::as_str), Some("2"));
        assert!(sims.iter().all(|s| s.name() == Some("base")));
    }

    #[test]
    fn test_generated_uids_are_distinct() {
        let mut sweep = SweepBuilder::new();
        sweep.add_sweep_definition("seed", 0..10);
        let sims = sweep.simulations(&Simulation::new());
        let mut uids: Vec<_> = sims.iter().map(|s| s.uid()).collect();
        uids.sort();
        uids.dedup();
        assert_eq!(uids.len(), 10);
    }

    #[test]
    fn test_empty_axes() {
        let sweep = SweepBuilder::new();
        assert_eq!(sweep.count(), 0);
        assert!(sweep.simulations(&Simulation::new()).is_empty());

        let mut empty_axis = SweepBuilder::new();
        empty_axis
            .add_sweep_definition("a", [1, 2])
            .add_sweep_definition("b", Vec::<Value>::new());
        assert_eq!(empty_axis.count(), 0);
    }
}
