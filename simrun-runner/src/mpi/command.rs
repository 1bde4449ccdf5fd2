//! `mpiexec` command lines

/// Builds the command line that runs a program on `cores` ranks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpiCommand {
    mpiexec: String,
    cores: usize,
}

impl MpiCommand {
    pub fn new(mpiexec: impl Into<String>, cores: usize) -> Self {
        Self {
            mpiexec: mpiexec.into(),
            cores,
        }
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Returns true when the program has to go through `mpiexec`
    pub fn is_parallel(&self) -> bool {
        self.cores > 1
    }

    /// Wraps `program` in `mpiexec`; a single core runs it directly
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        if !self.is_parallel() {
            return (program.to_string(), args.to_vec());
        }

        let mut wrapped = vec![
            // Ranks are placed by the OS; simulations are mostly memory bound
            "--bind-to".to_string(),
            "none".to_string(),
            "-n".to_string(),
            self.cores.to_string(),
            program.to_string(),
        ];
        wrapped.extend(args.iter().cloned());
        (self.mpiexec.clone(), wrapped)
    }
}
