use std::collections::{HashMap, HashSet};

use super::{CodecError, EncodeOptions, PaletteImage, RasterImage, Rgb, Token};

/// Divide every channel by `divisor`, rounding half to even.
///
/// A zero divisor is treated as 1.
pub fn quantize(image: &RasterImage, divisor: u8) -> RasterImage {
    let d = divisor.max(1);
    let q = |c: u8| {
        let (q, r) = (c / d, c % d);
        let twice = u16::from(r) * 2;
        if twice > u16::from(d) || (twice == u16::from(d) && q % 2 == 1) {
            q + 1
        } else {
            q
        }
    };
    let pixels = image
        .pixels()
        .iter()
        .map(|&[r, g, b]| [q(r), q(g), q(b)])
        .collect();
    RasterImage::from_parts(image.width(), image.height(), pixels)
}

pub fn encode(image: &RasterImage, options: EncodeOptions) -> Result<PaletteImage, CodecError> {
    options.validate()?;
    let quantized = quantize(image, options.quantize_divisor);
    let candidates = row_frequent_colors(&quantized, options.min_run_length);

    let mut palette: Vec<Rgb> = Vec::new();
    let mut palette_index: HashMap<Rgb, u32> = HashMap::new();
    let mut columns = Vec::with_capacity(quantized.width() as usize);

    for x in 0..quantized.width() {
        let column: Vec<Rgb> = quantized.column(x).collect();
        let mut tokens = Vec::new();
        let mut start = 0;
        while start < column.len() {
            let color = column[start];
            let end = column[start..]
                .iter()
                .position(|&c| c != color)
                .map_or(column.len(), |len| start + len);
            let count = (end - start) as u32;

            if count >= options.min_run_length && candidates.contains(&color) {
                let index = *palette_index.entry(color).or_insert_with(|| {
                    palette.push(color);
                    palette.len() as u32
                });
                tokens.push(Token::Run { count, index });
            } else {
                tokens.extend(std::iter::repeat_n(Token::Literal(color), count as usize));
            }
            start = end;
        }
        columns.push(tokens);
    }

    Ok(PaletteImage {
        width: quantized.width(),
        height: quantized.height(),
        palette,
        columns,
    })
}

/// Reconstruct the quantized pixel grid. Channels are not rescaled.
pub fn decode(encoded: &PaletteImage) -> Result<RasterImage, CodecError> {
    let (width, height) = (encoded.width, encoded.height);
    if encoded.columns.len() != width as usize {
        return Err(CodecError::ColumnCount {
            expected: width,
            actual: encoded.columns.len(),
        });
    }

    let mut pixels = vec![[0u8; 3]; width as usize * height as usize];
    for (x, tokens) in encoded.columns.iter().enumerate() {
        let mut y = 0usize;
        for token in tokens {
            let (color, count) = match *token {
                Token::Literal(rgb) => (rgb, 1),
                Token::Run { count, index } => {
                    let color = index
                        .checked_sub(1)
                        .and_then(|i| encoded.palette.get(i as usize))
                        .ok_or(CodecError::PaletteIndex {
                            index,
                            len: encoded.palette.len(),
                        })?;
                    (*color, count as usize)
                }
            };
            if y + count > height as usize {
                return Err(CodecError::ColumnLength {
                    column: x,
                    expected: height,
                    actual: y + count,
                });
            }
            for row in y..y + count {
                pixels[row * width as usize + x] = color;
            }
            y += count;
        }
        if y != height as usize {
            return Err(CodecError::ColumnLength {
                column: x,
                expected: height,
                actual: y,
            });
        }
    }

    Ok(RasterImage::from_parts(width, height, pixels))
}

/// Colors that occur at least `min_count` times within a single row.
fn row_frequent_colors(image: &RasterImage, min_count: u32) -> HashSet<Rgb> {
    let mut frequent = HashSet::new();
    let mut counts: HashMap<Rgb, u32> = HashMap::new();
    for row in image.rows() {
        counts.clear();
        for &color in row {
            *counts.entry(color).or_default() += 1;
        }
        frequent.extend(
            counts
                .iter()
                .filter(|&(_, &n)| n >= min_count)
                .map(|(&color, _)| color),
        );
    }
    frequent
}
