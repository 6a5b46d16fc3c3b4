//! Geo layer on top of the sorted-set engine.
//!
//! A point is stored as a 52-bit geohash: latitude and longitude are
//! normalized onto a 2^26 grid and their bits interleaved (latitude in the
//! even positions), and the resulting integer becomes the member's
//! sorted-set score. Decoding recovers the center of the grid cell.

use super::sorted_set::ZSetEngine;
use crate::protocol::Frame;

pub(crate) const MIN_LATITUDE: f64 = -85.05112878;
pub(crate) const MAX_LATITUDE: f64 = 85.05112878;
pub(crate) const MIN_LONGITUDE: f64 = -180.0;
pub(crate) const MAX_LONGITUDE: f64 = 180.0;

const LATITUDE_RANGE: f64 = MAX_LATITUDE - MIN_LATITUDE;
const LONGITUDE_RANGE: f64 = MAX_LONGITUDE - MIN_LONGITUDE;
const GRID_CELLS: f64 = (1u64 << 26) as f64;

const EARTH_RADIUS_M: f64 = 6_372_797.560856;

fn spread_u32_to_u64(v: u32) -> u64 {
    let mut r = u64::from(v);
    r = (r | (r << 16)) & 0x0000_FFFF_0000_FFFF;
    r = (r | (r << 8)) & 0x00FF_00FF_00FF_00FF;
    r = (r | (r << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    r = (r | (r << 2)) & 0x3333_3333_3333_3333;
    r = (r | (r << 1)) & 0x5555_5555_5555_5555;
    r
}

fn compact_u64_to_u32(v: u64) -> u32 {
    let mut r = v & 0x5555_5555_5555_5555;
    r = (r | (r >> 1)) & 0x3333_3333_3333_3333;
    r = (r | (r >> 2)) & 0x0F0F_0F0F_0F0F_0F0F;
    r = (r | (r >> 4)) & 0x00FF_00FF_00FF_00FF;
    r = (r | (r >> 8)) & 0x0000_FFFF_0000_FFFF;
    r = (r | (r >> 16)) & 0x0000_0000_FFFF_FFFF;
    r as u32
}

/// interleave a point into its 52-bit geohash
pub(crate) fn encode(latitude: f64, longitude: f64) -> u64 {
    let norm_lat = GRID_CELLS * (latitude - MIN_LATITUDE) / LATITUDE_RANGE;
    let norm_lon = GRID_CELLS * (longitude - MIN_LONGITUDE) / LONGITUDE_RANGE;
    spread_u32_to_u64(norm_lat as u32) | (spread_u32_to_u64(norm_lon as u32) << 1)
}

/// recover the grid-cell center of a 52-bit geohash as `(latitude,
/// longitude)`
pub(crate) fn decode(geo_code: u64) -> (f64, f64) {
    let grid_lat = compact_u64_to_u32(geo_code);
    let grid_lon = compact_u64_to_u32(geo_code >> 1);
    let latitude = MIN_LATITUDE + LATITUDE_RANGE * (f64::from(grid_lat) + 0.5) / GRID_CELLS;
    let longitude = MIN_LONGITUDE + LONGITUDE_RANGE * (f64::from(grid_lon) + 0.5) / GRID_CELLS;
    (latitude, longitude)
}

/// great-circle distance in metres
pub(crate) fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Decimal rendering with 17 significant digits, `%.17g`-style: fixed
/// notation while the exponent allows it, scientific otherwise, trailing
/// zeros trimmed. Scores and coordinates are printed through this.
pub(crate) fn format_float(value: f64) -> String {
    const SIG: usize = 17;
    if value == 0.0 {
        return String::from("0");
    }
    // round to 17 significant digits in scientific form, then lay the
    // digits out by exponent
    let sci = format!("{:.*e}", SIG - 1, value);
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exp: i32 = match exp.parse() {
        Ok(exp) => exp,
        Err(_) => return sci,
    };
    let digits: String = mantissa.chars().filter(|c| c.is_ascii_digit()).collect();

    let mut out = String::new();
    if mantissa.starts_with('-') {
        out.push('-');
    }
    if exp >= -4 && exp < SIG as i32 {
        if exp >= 0 {
            let point = exp as usize + 1;
            out.push_str(&digits[..point]);
            let frac = digits[point..].trim_end_matches('0');
            if !frac.is_empty() {
                out.push('.');
                out.push_str(frac);
            }
        } else {
            out.push_str("0.");
            for _ in 0..(-exp - 1) {
                out.push('0');
            }
            out.push_str(digits.trim_end_matches('0'));
        }
    } else {
        out.push_str(&digits[..1]);
        let frac = digits[1..].trim_end_matches('0');
        if !frac.is_empty() {
            out.push('.');
            out.push_str(frac);
        }
        out.push('e');
        out.push_str(&format!("{:+03}", exp));
    }
    out
}

fn unit_to_metres(unit: &str) -> Option<f64> {
    if unit.eq_ignore_ascii_case("m") {
        Some(1.0)
    } else if unit.eq_ignore_ascii_case("km") {
        Some(1000.0)
    } else if unit.eq_ignore_ascii_case("mi") {
        Some(1609.34)
    } else if unit.eq_ignore_ascii_case("ft") {
        Some(0.3048)
    } else {
        None
    }
}

fn parse_point(lon_text: &str, lat_text: &str) -> Result<(f64, f64), Frame> {
    let lon = lon_text
        .parse::<f64>()
        .map_err(|_| Frame::err("value is not a valid float"))?;
    let lat = lat_text
        .parse::<f64>()
        .map_err(|_| Frame::err("value is not a valid float"))?;
    let bad_lon = !(MIN_LONGITUDE..=MAX_LONGITUDE).contains(&lon);
    let bad_lat = !(MIN_LATITUDE..=MAX_LATITUDE).contains(&lat);
    if bad_lon || bad_lat {
        let what = match (bad_lon, bad_lat) {
            (true, true) => "longitude,latitude",
            (true, false) => "longitude",
            _ => "latitude",
        };
        return Err(Frame::err(format!("invalid {} value", what)));
    }
    Ok((lon, lat))
}

pub(crate) fn geoadd(zsets: &ZSetEngine, args: &[String]) -> Frame {
    if args.len() < 4 {
        return Frame::err("GEOADD requires key, longitude, latitude and member");
    }
    let (lon, lat) = match parse_point(&args[1], &args[2]) {
        Ok(point) => point,
        Err(reply) => return reply,
    };
    let score = encode(lat, lon) as f64;
    let added = zsets.insert(&args[0], score, &args[3]);
    Frame::Integer(if added { 1 } else { 0 })
}

pub(crate) fn geopos(zsets: &ZSetEngine, args: &[String]) -> Frame {
    if args.len() < 2 {
        return Frame::err("GEOPOS requires key and member");
    }
    let positions = args[1..]
        .iter()
        .map(|member| match zsets.score_of(&args[0], member) {
            Some(score) => {
                let (lat, lon) = decode(score as u64);
                Frame::Array(vec![
                    Frame::Bulk(format_float(lon)),
                    Frame::Bulk(format_float(lat)),
                ])
            }
            None => Frame::NullArray,
        })
        .collect();
    Frame::Array(positions)
}

pub(crate) fn geodist(zsets: &ZSetEngine, args: &[String]) -> Frame {
    if args.len() < 3 {
        return Frame::err("GEODIST requires key and two members");
    }
    let divisor = match args.get(3) {
        Some(unit) => match unit_to_metres(unit) {
            Some(factor) => factor,
            None => return Frame::err("unsupported unit provided. please use m, km, ft, mi"),
        },
        None => 1.0,
    };
    let first = zsets.score_of(&args[0], &args[1]);
    let second = zsets.score_of(&args[0], &args[2]);
    match (first, second) {
        (Some(a), Some(b)) => {
            let (lat1, lon1) = decode(a as u64);
            let (lat2, lon2) = decode(b as u64);
            let metres = haversine(lat1, lon1, lat2, lon2);
            Frame::Bulk(format!("{:.4}", metres / divisor))
        }
        _ => Frame::NullBulk,
    }
}

pub(crate) fn geosearch(zsets: &ZSetEngine, args: &[String]) -> Frame {
    if args.len() < 7
        || !args[1].eq_ignore_ascii_case("fromlonlat")
        || !args[4].eq_ignore_ascii_case("byradius")
    {
        return Frame::err("unsupported GEOSEARCH mode, use FROMLONLAT and BYRADIUS");
    }
    let (lon, lat) = match parse_point(&args[2], &args[3]) {
        Ok(point) => point,
        Err(reply) => return reply,
    };
    let radius = match args[5].parse::<f64>() {
        Ok(radius) if radius >= 0.0 => radius,
        _ => return Frame::err("value is not a valid float"),
    };
    let factor = match unit_to_metres(&args[6]) {
        Some(factor) => factor,
        None => return Frame::err("unsupported unit provided. please use m, km, ft, mi"),
    };
    let radius_m = radius * factor;

    let hits = zsets
        .members_with_scores(&args[0])
        .into_iter()
        .filter(|(_, score)| {
            let (mlat, mlon) = decode(*score as u64);
            haversine(lat, lon, mlat, mlon) <= radius_m
        })
        .map(|(member, _)| Frame::Bulk(member))
        .collect();
    Frame::Array(hits)
}
