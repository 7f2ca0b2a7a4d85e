//! Rule builders for the steps an archive run schedules.
//!
//! Each builder fixes the outputs and dependencies of one step so the
//! fan-in shape (intersect leaves -> concatenate -> stockpile) stays uniform.

use super::rule::Rule;
use crate::config::CommandNames;
use crate::model::identity::EntityId;
use crate::model::metadata::ParameterBlock;

/// Axis along which intersected columns are joined into a matrix.
pub const COLUMN_AXIS: u8 = 1;

/// Leaf rule: intersect one layer with the shapegrid into one column file.
pub fn intersect_rule(
    names: &CommandNames,
    shapegrid: &str,
    layer: &str,
    column: &str,
    ident: &str,
    params: &ParameterBlock,
) -> Rule {
    let mut args = vec![names.intersect.clone(), "--ident".to_string(), ident.to_string()];
    for (name, value) in params.iter() {
        args.push(format!("--{name}"));
        args.push(value.to_string());
    }
    args.extend([shapegrid.to_string(), layer.to_string(), column.to_string()]);

    Rule::new(shell_words::join(&args), [column], [shapegrid, layer])
        .with_comment(format!("Intersect {ident}"))
}

/// Joins column files into one matrix file.
pub fn concatenate_rule(names: &CommandNames, inputs: &[String], output: &str) -> Rule {
    let mut args = vec![
        names.concatenate.clone(),
        "--axis".to_string(),
        COLUMN_AXIS.to_string(),
        output.to_string(),
    ];
    args.extend(inputs.iter().cloned());

    Rule::new(shell_words::join(&args), [output], inputs.iter().cloned())
        .with_comment(format!("Concatenate {} columns", inputs.len()))
}

/// Records a finished matrix in the catalog and touches its success file.
pub fn stockpile_rule(
    names: &CommandNames,
    matrix_id: EntityId,
    success: &str,
    artifact: &str,
) -> Rule {
    let args = [
        names.stockpile.clone(),
        "--matrix".to_string(),
        matrix_id.to_string(),
        "--success".to_string(),
        success.to_string(),
        artifact.to_string(),
    ];

    Rule::new(shell_words::join(&args), [success], [artifact])
        .with_comment(format!("Stockpile matrix {matrix_id}"))
        .run_locally()
}

/// Starts per-species processing from the archive configuration record.
pub fn species_step_rule(
    names: &CommandNames,
    config_record: &str,
    success: &str,
    extra_dependencies: &[String],
) -> Rule {
    let args = [
        names.species.clone(),
        "--success".to_string(),
        success.to_string(),
        config_record.to_string(),
    ];
    let dependencies = std::iter::once(config_record.to_string())
        .chain(extra_dependencies.iter().cloned());

    Rule::new(shell_words::join(&args), [success], dependencies)
        .with_comment("Start per-species processing")
        .run_locally()
}

/// Loads a taxonomy dump into the catalog.
pub fn taxonomy_rule(
    names: &CommandNames,
    source_name: &str,
    taxonomy_file: &str,
    success: &str,
) -> Rule {
    let args = [
        names.taxonomy.clone(),
        "--source".to_string(),
        source_name.to_string(),
        "--success".to_string(),
        success.to_string(),
        taxonomy_file.to_string(),
    ];

    Rule::new(shell_words::join(&args), [success], [taxonomy_file])
        .with_comment(format!("Catalog taxonomy from {source_name}"))
}

#[cfg(test)]
mod tests {
    use super::{concatenate_rule, intersect_rule, stockpile_rule};
    use crate::config::CommandNames;
    use crate::model::metadata::ParameterBlock;
    use uuid::Uuid;

    #[test]
    fn intersect_reads_grid_and_layer_and_writes_column() {
        let names = CommandNames::default();
        let params = ParameterBlock::new().with("min_percent", 25_i64);
        let rule = intersect_rule(
            &names,
            "/g/grid.grid",
            "/l/bio 1.tif",
            "/m/bio1.lmm",
            "bio1",
            &params,
        );

        assert_eq!(rule.outputs, vec!["/m/bio1.lmm"]);
        assert_eq!(rule.dependencies, vec!["/g/grid.grid", "/l/bio 1.tif"]);
        assert!(rule.command.contains("--min_percent 25"));
        assert!(rule.command.contains("'/l/bio 1.tif'"));
    }

    #[test]
    fn stockpile_runs_locally_on_concatenated_matrix() {
        let names = CommandNames::default();
        let inputs = vec!["a.lmm".to_string(), "b.lmm".to_string()];
        let concat = concatenate_rule(&names, &inputs, "m.lmm");
        let stockpile = stockpile_rule(&names, Uuid::new_v4(), "m.success", "m.lmm");

        assert_eq!(concat.dependencies, inputs);
        assert_eq!(stockpile.dependencies, vec!["m.lmm"]);
        assert!(stockpile.local);
    }
}
