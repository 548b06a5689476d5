//! Builders to construct processing units from configuration.

use std::collections::HashMap;

use crate::config::UnitSetConfig;
use crate::core::{ProcessingUnit, Spawn, UnitError};

/// Build one processing unit per entry of a unit set, sharing `spawner`.
///
/// Units are returned in the `Created` state.
///
/// # Errors
///
/// `UnitError::Config` when the set or any unit fails validation.
pub fn build_units<S>(
    cfg: &UnitSetConfig,
    spawner: &S,
) -> Result<HashMap<String, ProcessingUnit<S>>, UnitError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    cfg.validate()
        .map_err(|e| UnitError::Config(format!("config invalid: {e}")))?;

    let mut units = HashMap::with_capacity(cfg.units.len());
    for (name, unit_cfg) in &cfg.units {
        let unit = ProcessingUnit::with_spawner(unit_cfg.clone(), spawner.clone())
            .map_err(|e| UnitError::Config(format!("unit `{name}`: {e}")))?;
        tracing::debug!(unit = %name, unit_id = %unit.id(), "built processing unit");
        units.insert(name.clone(), unit);
    }

    Ok(units)
}

/// Start every unit in the map.
///
/// # Errors
///
/// The first start failure, tagged with the unit name; units started before
/// it keep running.
pub fn start_units<S>(units: &HashMap<String, ProcessingUnit<S>>) -> Result<(), (String, UnitError)>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    for (name, unit) in units {
        unit.start().map_err(|e| (name.clone(), e))?;
    }
    Ok(())
}
