//! Variable catalog and physical unit rules.
//!
//! A [`Variable`] is the (quantity, resolution, aggregation) triple that names
//! one measurable series. Its identifier string is built once from the triple
//! and doubles as the request key and the output column name:
//!
//! ```
//! use hydrofetch_core::variable::{Aggregation, Quantity, Resolution, Variable};
//!
//! let variable = Variable::new(Quantity::Discharge, Resolution::Daily, Aggregation::Mean);
//! assert_eq!(variable.id(), "discharge-daily-mean");
//! assert_eq!("discharge-daily-mean".parse::<Variable>().unwrap(), variable);
//! ```
//!
//! Every canonical series is stored in SI units. [`convert`] takes a value in a
//! provider-native [`Unit`] and returns it in the SI unit of the quantity
//! ([`unit_for`]).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised by catalog lookups and unit conversion.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// The quantity name is not part of the catalog.
    #[error("unknown quantity: {0}")]
    UnknownQuantity(String),

    /// The resolution name is not part of the catalog.
    #[error("unknown resolution: {0}")]
    UnknownResolution(String),

    /// The aggregation name is not part of the catalog.
    #[error("unknown aggregation: {0}")]
    UnknownAggregation(String),

    /// The identifier does not have the `quantity-resolution-aggregation` shape.
    #[error("malformed variable identifier: {0}")]
    MalformedId(String),

    /// The source unit measures a different dimension than the quantity.
    #[error("unit {unit} cannot express {quantity}")]
    UnitMismatch {
        /// Source unit.
        unit: Unit,
        /// Target quantity.
        quantity: Quantity,
    },
}

/// A measurable physical quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quantity {
    /// River discharge (streamflow).
    Discharge,
    /// Water level above the gauge datum.
    Stage,
    /// Water temperature.
    WaterTemperature,
    /// Precipitation aggregated over the catchment.
    CatchmentPrecipitation,
}

impl Quantity {
    /// Every quantity in the catalog.
    pub const ALL: [Quantity; 4] = [
        Quantity::Discharge,
        Quantity::Stage,
        Quantity::WaterTemperature,
        Quantity::CatchmentPrecipitation,
    ];

    /// Catalog name of the quantity.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Quantity::Discharge => "discharge",
            Quantity::Stage => "stage",
            Quantity::WaterTemperature => "water_temperature",
            Quantity::CatchmentPrecipitation => "catchment_precipitation",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quantity {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| CatalogError::UnknownQuantity(s.to_string()))
    }
}

/// Temporal resolution of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resolution {
    /// Values as measured, at the sensor's own cadence.
    Instantaneous,
    /// One value per hour.
    Hourly,
    /// One value per day.
    Daily,
    /// One value per month.
    Monthly,
}

impl Resolution {
    /// Every resolution in the catalog.
    pub const ALL: [Resolution; 4] = [
        Resolution::Instantaneous,
        Resolution::Hourly,
        Resolution::Daily,
        Resolution::Monthly,
    ];

    /// Catalog name of the resolution.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Instantaneous => "instantaneous",
            Resolution::Hourly => "hourly",
            Resolution::Daily => "daily",
            Resolution::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| CatalogError::UnknownResolution(s.to_string()))
    }
}

/// How values within one resolution step were combined by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Aggregation {
    /// Arithmetic mean.
    Mean,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Sum (precipitation totals).
    Sum,
}

impl Aggregation {
    /// Every aggregation in the catalog.
    pub const ALL: [Aggregation; 4] = [
        Aggregation::Mean,
        Aggregation::Min,
        Aggregation::Max,
        Aggregation::Sum,
    ];

    /// Catalog name of the aggregation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Sum => "sum",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Aggregation::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| CatalogError::UnknownAggregation(s.to_string()))
    }
}

/// One measurable series: the (quantity, resolution, aggregation) triple.
///
/// The identifier is computed once at construction; equality, ordering and
/// hashing follow the triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Variable {
    quantity: Quantity,
    resolution: Resolution,
    aggregation: Aggregation,
    id: String,
}

/// The set of variables an adapter supports.
pub type VariableSet = BTreeSet<Variable>;

impl Variable {
    /// Builds a variable from its triple.
    #[must_use]
    pub fn new(quantity: Quantity, resolution: Resolution, aggregation: Aggregation) -> Self {
        let id = format!("{quantity}-{resolution}-{aggregation}");
        Self {
            quantity,
            resolution,
            aggregation,
            id,
        }
    }

    /// Identifier string, also used as the output column name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Measured quantity.
    #[must_use]
    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    /// Temporal resolution.
    #[must_use]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Aggregation applied by the source.
    #[must_use]
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// SI unit values of this variable are reported in.
    #[must_use]
    pub fn unit(&self) -> Unit {
        unit_for(self.quantity)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for Variable {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (Some(quantity), Some(resolution), Some(aggregation), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CatalogError::MalformedId(s.to_string()));
        };

        Ok(Variable::new(
            quantity.parse()?,
            resolution.parse()?,
            aggregation.parse()?,
        ))
    }
}

/// Builds the variable set for an adapter from a list of triples.
#[must_use]
pub fn variable_set(triples: &[(Quantity, Resolution, Aggregation)]) -> VariableSet {
    triples
        .iter()
        .map(|&(q, r, a)| Variable::new(q, r, a))
        .collect()
}

/// Physical dimension a unit measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Flow,
    Length,
    Temperature,
}

/// Units providers report values in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    /// m³/s (SI discharge).
    CubicMetresPerSecond,
    /// L/s.
    LitresPerSecond,
    /// ft³/s.
    CubicFeetPerSecond,
    /// m (SI stage).
    Metre,
    /// cm.
    Centimetre,
    /// mm (SI precipitation depth).
    Millimetre,
    /// International foot.
    Foot,
    /// °C (SI temperature).
    DegreesCelsius,
    /// °F.
    DegreesFahrenheit,
    /// K.
    Kelvin,
}

impl Unit {
    /// Unit symbol.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::CubicMetresPerSecond => "m³/s",
            Unit::LitresPerSecond => "L/s",
            Unit::CubicFeetPerSecond => "ft³/s",
            Unit::Metre => "m",
            Unit::Centimetre => "cm",
            Unit::Millimetre => "mm",
            Unit::Foot => "ft",
            Unit::DegreesCelsius => "°C",
            Unit::DegreesFahrenheit => "°F",
            Unit::Kelvin => "K",
        }
    }

    fn dimension(self) -> Dimension {
        match self {
            Unit::CubicMetresPerSecond | Unit::LitresPerSecond | Unit::CubicFeetPerSecond => {
                Dimension::Flow
            }
            Unit::Metre | Unit::Centimetre | Unit::Millimetre | Unit::Foot => Dimension::Length,
            Unit::DegreesCelsius | Unit::DegreesFahrenheit | Unit::Kelvin => {
                Dimension::Temperature
            }
        }
    }

    /// Converts into the dimension's base unit (m³/s, m, °C).
    fn to_base(self, value: f64) -> f64 {
        match self {
            Unit::CubicMetresPerSecond | Unit::Metre | Unit::DegreesCelsius => value,
            Unit::LitresPerSecond => value / 1000.0,
            Unit::CubicFeetPerSecond => value * 0.028_316_846_592,
            Unit::Centimetre => value / 100.0,
            Unit::Millimetre => value / 1000.0,
            Unit::Foot => value * 0.3048,
            Unit::DegreesFahrenheit => (value - 32.0) * 5.0 / 9.0,
            Unit::Kelvin => value - 273.15,
        }
    }

    /// Converts out of the dimension's base unit.
    fn from_base(self, value: f64) -> f64 {
        match self {
            Unit::CubicMetresPerSecond | Unit::Metre | Unit::DegreesCelsius => value,
            Unit::LitresPerSecond => value * 1000.0,
            Unit::CubicFeetPerSecond => value / 0.028_316_846_592,
            Unit::Centimetre => value * 100.0,
            Unit::Millimetre => value * 1000.0,
            Unit::Foot => value / 0.3048,
            Unit::DegreesFahrenheit => value * 9.0 / 5.0 + 32.0,
            Unit::Kelvin => value + 273.15,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// SI unit a quantity is reported in.
#[must_use]
pub fn unit_for(quantity: Quantity) -> Unit {
    match quantity {
        Quantity::Discharge => Unit::CubicMetresPerSecond,
        Quantity::Stage => Unit::Metre,
        Quantity::WaterTemperature => Unit::DegreesCelsius,
        Quantity::CatchmentPrecipitation => Unit::Millimetre,
    }
}

/// Converts `value` measured in `from` into the SI unit of `quantity`.
///
/// # Errors
///
/// Returns [`CatalogError::UnitMismatch`] when `from` measures a different
/// dimension than `quantity` (e.g. a length unit for discharge).
pub fn convert(value: f64, from: Unit, quantity: Quantity) -> Result<f64, CatalogError> {
    let target = unit_for(quantity);
    if from.dimension() != target.dimension() {
        return Err(CatalogError::UnitMismatch {
            unit: from,
            quantity,
        });
    }
    if from == target {
        return Ok(value);
    }
    Ok(target.from_base(from.to_base(value)))
}
