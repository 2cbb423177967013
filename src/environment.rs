use super::*;

/// Interface to the environment templater that surrounds the executor.
///
/// The templater owns the task's variable set; the executor only asks it to
/// expand `${VAR}` placeholders (on the command, its arguments, and dynamic
/// service fields) and to produce the environment list the child is started
/// with.
pub trait TaskEnvironment: fmt::Debug + Send + Sync {
  /// The `KEY=VALUE` pairs the child process is started with.
  fn env_list(&self) -> Vec<(String, String)>;

  /// Expand `${VAR}` placeholders in `input`.
  ///
  /// Placeholders naming unknown variables are left untouched.
  fn interpolate(&self, input: &str) -> String;

  fn interpolate_all(&self, inputs: &[String]) -> Vec<String> {
    inputs.iter().map(|input| self.interpolate(input)).collect()
  }
}

/// A templater backed by a plain variable map.
#[derive(Clone, Debug, Default)]
pub struct MapEnvironment {
  variables: HashMap<String, String>,
}

impl MapEnvironment {
  pub fn new(variables: HashMap<String, String>) -> Self {
    Self { variables }
  }

  pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.variables.insert(key.into(), value.into());
    self
  }
}

impl TaskEnvironment for MapEnvironment {
  fn env_list(&self) -> Vec<(String, String)> {
    let mut list: Vec<(String, String)> = self
      .variables
      .iter()
      .map(|(key, value)| (key.clone(), value.clone()))
      .collect();

    list.sort();

    list
  }

  fn interpolate(&self, input: &str) -> String {
    let mut output = String::with_capacity(input.len());

    let mut rest = input;

    while let Some(start) = rest.find("${") {
      output.push_str(&rest[..start]);

      match rest[start + 2..].find('}') {
        Some(length) => {
          let key = &rest[start + 2..start + 2 + length];

          match self.variables.get(key) {
            Some(value) => output.push_str(value),
            None => output.push_str(&rest[start..start + length + 3]),
          }

          rest = &rest[start + length + 3..];
        }
        None => {
          output.push_str(&rest[start..]);
          rest = "";
        }
      }
    }

    output.push_str(rest);

    output
  }
}
